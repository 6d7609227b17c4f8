//! Which permission each client action needs.

use crate::permissions::{
    has_permission, CONSOLE_USE, PLAYERS_BAN, PLAYERS_KICK, SERVER_RESTART, SERVER_SAVE_ALL,
    SERVER_STOP, WORLDS_GAMERULES, WORLDS_MANAGE, WORLDS_RESET,
};

use super::protocol::ClientAction;

/// Console commands with a dedicated permission node. Anything else needs
/// plain console use.
const PRIVILEGED_COMMANDS: &[(&str, &str)] = &[
    ("stop", SERVER_STOP),
    ("restart", SERVER_RESTART),
    ("save-all", SERVER_SAVE_ALL),
    ("kick", PLAYERS_KICK),
    ("ban", PLAYERS_BAN),
];

/// Permission needed to run `command` from the web console.
pub fn console_command_permission(command: &str) -> &'static str {
    let command = command.trim().to_lowercase();
    let head = command.split_whitespace().next().unwrap_or_default();
    PRIVILEGED_COMMANDS
        .iter()
        .find(|(name, _)| *name == head)
        .map_or(CONSOLE_USE, |&(_, node)| node)
}

pub fn world_action_permission(action: &str) -> &'static str {
    match action {
        "reset" => WORLDS_RESET,
        "set_gamerule" => WORLDS_GAMERULES,
        _ => WORLDS_MANAGE,
    }
}

/// Permission `action` requires, or `None` for events clients may never send.
pub fn required_permission(action: &ClientAction) -> Option<&'static str> {
    match action.event.as_str() {
        "console_command" => Some(console_command_permission(&action.command)),
        "console_tab_complete" | "clear_logs" => Some(CONSOLE_USE),
        "world_action" => Some(world_action_permission(action.world_action())),
        _ => None,
    }
}

pub fn is_authorized<S: AsRef<str>>(action: &ClientAction, permissions: &[S]) -> bool {
    required_permission(action).is_some_and(|node| has_permission(permissions, node))
}

/// `reason` sent back in `permission_denied`.
pub fn denial_reason(event: &str) -> &'static str {
    if event == "clear_logs" {
        "clear_logs"
    } else {
        "forbidden"
    }
}

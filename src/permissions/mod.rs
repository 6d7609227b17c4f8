//! Permission nodes and matching.
//!
//! Nodes are dotted, case-insensitive strings. A granted node satisfies a
//! required node when it is equal, when it is a *pack* that implies it (see
//! [`pack_implies`]), or when it ends in `.*` and the required node shares
//! its prefix. File permissions can additionally be scoped to a path:
//! `beacon.access.files.view.plugins.beacon` grants viewing
//! `plugins/Beacon/...`.

pub mod resolver;

use std::collections::HashSet;

use serde::Serialize;

pub use resolver::{PermissionResolver, PermissionSet, PermissionSource};

pub const ACCESS_ALL: &str = "beacon.access.*";
pub const PACK_DASHBOARD: &str = "beacon.access.dashboard";
pub const PACK_CONSOLE: &str = "beacon.access.console";
pub const PACK_PLAYERS: &str = "beacon.access.players";
pub const PACK_WORLDS: &str = "beacon.access.worlds";
pub const PACK_FILES: &str = "beacon.access.files";
pub const ACCESS_VIEW: &str = "beacon.access.access";
pub const ACCESS_MANAGE: &str = "beacon.access.access.manage";
pub const DASHBOARD_VIEW: &str = "beacon.access.dashboard.view";
pub const CONSOLE_VIEW: &str = "beacon.access.console.view";
pub const CONSOLE_USE: &str = "beacon.access.console.use";
pub const PLAYERS_VIEW: &str = "beacon.access.players.view";
pub const PLAYERS_KICK: &str = "beacon.access.players.kick";
pub const PLAYERS_BAN: &str = "beacon.access.players.ban";
pub const WORLDS_VIEW: &str = "beacon.access.worlds.view";
pub const WORLDS_MANAGE: &str = "beacon.access.worlds.manage";
pub const WORLDS_RESET: &str = "beacon.access.worlds.reset";
pub const WORLDS_GAMERULES: &str = "beacon.access.worlds.gamerules";
pub const SERVER_STOP: &str = "beacon.access.stop";
pub const SERVER_RESTART: &str = "beacon.access.restart";
pub const SERVER_SAVE_ALL: &str = "beacon.access.saveall";
pub const FILES_ALL: &str = "beacon.access.files.all";
pub const FILES_VIEW: &str = "beacon.access.files.view";
pub const FILES_EDIT: &str = "beacon.access.files.edit";
pub const FILES_DELETE: &str = "beacon.access.files.delete";
pub const FILES_DOWNLOAD: &str = "beacon.access.files.download";

const FILE_SCOPE_BASE: &str = "beacon.access.files.";
const FILE_VIEW_SCOPE_PREFIX: &str = "beacon.access.files.view.";

/// Every node the access page offers, grouped by category.
pub const NODE_CATEGORIES: &[(&str, &str, &[(&str, &str)])] = &[
    (
        "global",
        "Global",
        &[
            (ACCESS_ALL, "Full Access (All Pages)"),
            (ACCESS_VIEW, "Access Page"),
            (ACCESS_MANAGE, "Manage Access (Sessions + Permissions)"),
        ],
    ),
    (
        "dashboard",
        "Dashboard",
        &[
            (PACK_DASHBOARD, "Dashboard Pack"),
            (DASHBOARD_VIEW, "View Dashboard"),
            (SERVER_STOP, "Stop Server"),
            (SERVER_RESTART, "Restart Server"),
            (SERVER_SAVE_ALL, "Save All"),
        ],
    ),
    (
        "console",
        "Console",
        &[
            (PACK_CONSOLE, "Console Pack"),
            (CONSOLE_VIEW, "View Console"),
            (CONSOLE_USE, "Use Console"),
        ],
    ),
    (
        "players",
        "Players",
        &[
            (PACK_PLAYERS, "Players Pack"),
            (PLAYERS_VIEW, "View Players"),
            (PLAYERS_KICK, "Kick Players"),
            (PLAYERS_BAN, "Ban Players"),
        ],
    ),
    (
        "worlds",
        "Worlds",
        &[
            (PACK_WORLDS, "Worlds Pack"),
            (WORLDS_VIEW, "View Worlds"),
            (WORLDS_MANAGE, "Manage Worlds"),
            (WORLDS_RESET, "Reset Worlds"),
            (WORLDS_GAMERULES, "Edit Gamerules"),
        ],
    ),
    (
        "files",
        "Files",
        &[
            (PACK_FILES, "Files Pack"),
            (FILES_ALL, "All Files (Bypass Path Scope)"),
            (FILES_VIEW, "View Files"),
            (FILES_EDIT, "Edit Files"),
            (FILES_DELETE, "Delete Files"),
            (FILES_DOWNLOAD, "Download Files"),
        ],
    ),
];

/// Sorted, de-duplicated list of every node in [`NODE_CATEGORIES`].
pub fn all_nodes() -> Vec<&'static str> {
    let mut nodes: Vec<&'static str> = NODE_CATEGORIES
        .iter()
        .flat_map(|(_, _, perms)| perms.iter().map(|(node, _)| *node))
        .collect();
    nodes.sort_unstable();
    nodes.dedup();
    nodes
}

/// Lowercase, trim and de-duplicate, preserving first-seen order.
pub fn normalize<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in values {
        let normalized = value.as_ref().trim().to_lowercase();
        if normalized.is_empty() || !seen.insert(normalized.clone()) {
            continue;
        }
        out.push(normalized);
    }
    out
}

/// Fixed implication table for pack nodes.
fn pack_implies(granted: &str, required: &str) -> bool {
    match granted {
        PACK_DASHBOARD => matches!(
            required,
            DASHBOARD_VIEW | SERVER_STOP | SERVER_RESTART | SERVER_SAVE_ALL
        ),
        PACK_CONSOLE => matches!(required, CONSOLE_VIEW | CONSOLE_USE),
        PACK_PLAYERS => matches!(required, PLAYERS_VIEW | PLAYERS_KICK | PLAYERS_BAN),
        PACK_WORLDS => matches!(
            required,
            WORLDS_VIEW | WORLDS_MANAGE | WORLDS_RESET | WORLDS_GAMERULES
        ),
        PACK_FILES => matches!(
            required,
            FILES_ALL | FILES_VIEW | FILES_EDIT | FILES_DELETE | FILES_DOWNLOAD
        ),
        ACCESS_MANAGE => required == ACCESS_VIEW,
        _ => false,
    }
}

/// Does any node in `permissions` satisfy `required`?
pub fn has_permission<S: AsRef<str>>(permissions: &[S], required: &str) -> bool {
    let required = required.trim().to_lowercase();
    if required.is_empty() {
        return false;
    }

    permissions.iter().any(|granted| {
        let granted = granted.as_ref().trim().to_lowercase();
        if granted.is_empty() {
            return false;
        }
        if granted == required || pack_implies(&granted, &required) {
            return true;
        }
        granted.strip_suffix(".*").is_some_and(|prefix| {
            required == prefix
                || required
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    })
}

pub fn has_any_permission<S: AsRef<str>>(permissions: &[S], required: &[&str]) -> bool {
    required.iter().any(|r| has_permission(permissions, r))
}

/// True if the identity may open the file manager at all: a global view
/// grant, or any path-scoped view grant.
pub fn can_access_any_file_view<S: AsRef<str>>(permissions: &[S]) -> bool {
    if has_any_permission(permissions, &[ACCESS_ALL, PACK_FILES, FILES_ALL, FILES_VIEW]) {
        return true;
    }
    permissions
        .iter()
        .any(|granted| granted.as_ref().to_lowercase().starts_with(FILE_VIEW_SCOPE_PREFIX))
}

/// File action kinds that carry their own permission node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    View,
    Edit,
    Delete,
    Download,
}

impl FileAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Download => "download",
        }
    }

    /// Parse the access action name used in permission nodes.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "view" => Some(Self::View),
            "edit" => Some(Self::Edit),
            "delete" => Some(Self::Delete),
            "download" => Some(Self::Download),
            _ => None,
        }
    }
}

/// May `action` be performed on `raw_path`?
///
/// `beacon.access.*`, the files pack and `files.all` bypass path scope. The
/// global `files.<action>` node grants every path. Otherwise one of the
/// cumulative path keys must be granted as `files.<action>.<key>`. A path that
/// yields no keys (empty, or resolving to the root) is only viewable, and
/// only by someone who can view files at all.
pub fn can_access_file_path<S: AsRef<str>>(
    permissions: &[S],
    action: FileAction,
    raw_path: &str,
) -> bool {
    if has_any_permission(permissions, &[ACCESS_ALL, PACK_FILES, FILES_ALL]) {
        return true;
    }

    let global = format!("{FILE_SCOPE_BASE}{}", action.as_str());
    if has_permission(permissions, &global) {
        return true;
    }

    let keys = file_permission_keys(raw_path);
    if keys.is_empty() {
        return action == FileAction::View && can_access_any_file_view(permissions);
    }

    keys.iter()
        .any(|key| has_permission(permissions, &format!("{global}.{key}")))
}

/// Cumulative, sanitized dotted keys for a relative path.
///
/// `"plugins/Beacon/config.yml"` → `["plugins", "plugins.beacon",
/// "plugins.beacon.config_yml"]`. `..` is resolved lexically against the
/// segments before it and never climbs above the root, so keys always name
/// the path the plugin will actually open.
pub fn file_permission_keys(raw_path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    for segment in raw_path.trim().split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(sanitize_segment(other)),
        }
    }

    let mut keys = Vec::with_capacity(segments.len());
    for i in 1..=segments.len() {
        keys.push(segments[..i].join("."));
    }
    keys
}

/// Map a path segment onto `[a-z0-9_-]`, collapsing runs of anything else
/// into a single `_`. An all-invalid segment becomes `path`.
fn sanitize_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_underscore = false;
    for c in value.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "path".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Capability flags derived from a permission set, for the UI.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionGrants {
    pub can_view_dashboard: bool,
    pub can_view_console: bool,
    pub can_use_console: bool,
    pub can_view_players: bool,
    pub can_kick_players: bool,
    pub can_ban_players: bool,
    pub can_view_worlds: bool,
    pub can_manage_worlds: bool,
    pub can_reset_worlds: bool,
    pub can_edit_gamerules: bool,
    pub can_stop_server: bool,
    pub can_restart_server: bool,
    pub can_save_all: bool,
    pub can_view_files: bool,
    pub can_edit_files: bool,
    pub can_delete_files: bool,
    pub can_download_files: bool,
    pub can_view_access: bool,
    pub can_manage_access: bool,
}

impl SessionGrants {
    pub fn derive<S: AsRef<str>>(permissions: &[S]) -> Self {
        let has = |node| has_permission(permissions, node);
        Self {
            can_view_dashboard: has(DASHBOARD_VIEW),
            can_view_console: has(CONSOLE_VIEW),
            can_use_console: has(CONSOLE_USE),
            can_view_players: has(PLAYERS_VIEW),
            can_kick_players: has(PLAYERS_KICK),
            can_ban_players: has(PLAYERS_BAN),
            can_view_worlds: has(WORLDS_VIEW),
            can_manage_worlds: has(WORLDS_MANAGE),
            can_reset_worlds: has(WORLDS_RESET),
            can_edit_gamerules: has(WORLDS_GAMERULES),
            can_stop_server: has(SERVER_STOP),
            can_restart_server: has(SERVER_RESTART),
            can_save_all: has(SERVER_SAVE_ALL),
            can_view_files: can_access_any_file_view(permissions),
            can_edit_files: has(FILES_EDIT),
            can_delete_files: has(FILES_DELETE),
            can_download_files: has(FILES_DOWNLOAD),
            can_view_access: has_any_permission(
                permissions,
                &[ACCESS_ALL, ACCESS_VIEW, ACCESS_MANAGE],
            ),
            can_manage_access: has_any_permission(permissions, &[ACCESS_ALL, ACCESS_MANAGE]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: &[&str] = &[];

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(has_permission(&["Beacon.Access.Console.Use"], CONSOLE_USE));
        assert!(has_permission(&[CONSOLE_USE], "  BEACON.ACCESS.CONSOLE.USE "));
    }

    #[test]
    fn worlds_pack_implies_reset() {
        assert!(has_permission(&[PACK_WORLDS], "beacon.access.worlds.reset"));
        assert!(has_permission(&[PACK_WORLDS], WORLDS_GAMERULES));
        assert!(!has_permission(&[PACK_WORLDS], SERVER_STOP));
    }

    #[test]
    fn wildcard_implies_descendants_and_prefix() {
        assert!(has_permission(&["beacon.access.files.*"], FILES_DELETE));
        assert!(has_permission(&["beacon.access.files.*"], PACK_FILES));
        assert!(!has_permission(&["beacon.access.files.*"], "beacon.access.filesystem"));
        assert!(has_permission(&[ACCESS_ALL], SERVER_STOP));
    }

    #[test]
    fn empty_set_grants_nothing() {
        assert!(!has_permission(NONE, CONSOLE_USE));
        assert!(!has_permission(NONE, ""));
        assert!(!has_permission(&[CONSOLE_USE], "   "));
    }

    #[test]
    fn access_manage_implies_access_view() {
        assert!(has_permission(&[ACCESS_MANAGE], ACCESS_VIEW));
        assert!(!has_permission(&[ACCESS_VIEW], ACCESS_MANAGE));
    }

    #[test]
    fn normalize_lowercases_trims_and_dedups() {
        let out = normalize(["  A.b ", "a.B", "", "c"]);
        assert_eq!(out, vec!["a.b", "c"]);
    }

    #[test]
    fn file_keys_are_cumulative_and_sanitized() {
        assert_eq!(
            file_permission_keys("/plugins/Beacon/config.yml"),
            vec!["plugins", "plugins.beacon", "plugins.beacon.config_yml"]
        );
        assert_eq!(file_permission_keys("a//./b"), vec!["a", "a.b"]);
        assert_eq!(file_permission_keys("***"), vec!["path"]);
    }

    #[test]
    fn file_keys_resolve_parent_segments() {
        assert!(file_permission_keys("").is_empty());
        assert!(file_permission_keys("/").is_empty());
        assert!(file_permission_keys("logs/..").is_empty());
        assert_eq!(file_permission_keys("logs/../server.properties"), vec!["server_properties"]);
        assert_eq!(file_permission_keys("../etc/passwd"), vec!["etc", "etc.passwd"]);
        assert_eq!(file_permission_keys("logs/../../x"), vec!["x"]);
    }

    #[test]
    fn parent_segments_cannot_escape_a_scoped_grant() {
        let view_logs = ["beacon.access.files.view.logs"];
        assert!(can_access_file_path(&view_logs, FileAction::View, "logs/latest.log"));
        assert!(!can_access_file_path(&view_logs, FileAction::View, "server.properties"));
        assert!(!can_access_file_path(&view_logs, FileAction::View, "logs/../server.properties"));
        assert!(!can_access_file_path(&view_logs, FileAction::View, "logs/../../ops.json"));

        let edit_beacon = ["beacon.access.files.edit.plugins.beacon"];
        assert!(can_access_file_path(&edit_beacon, FileAction::Edit, "plugins/beacon/../beacon/x"));
        assert!(!can_access_file_path(&edit_beacon, FileAction::Edit, "plugins/beacon/../other/x"));
    }

    #[test]
    fn path_scoped_grant_covers_subtree_only() {
        let perms = ["beacon.access.files.edit.plugins.beacon"];
        assert!(can_access_file_path(&perms, FileAction::Edit, "plugins/Beacon/config.yml"));
        assert!(!can_access_file_path(&perms, FileAction::Edit, "plugins/Other/config.yml"));
        assert!(!can_access_file_path(&perms, FileAction::Delete, "plugins/Beacon/config.yml"));
    }

    #[test]
    fn global_and_bypass_nodes_cover_every_path() {
        assert!(can_access_file_path(&[FILES_DELETE], FileAction::Delete, "world/level.dat"));
        assert!(can_access_file_path(&[FILES_ALL], FileAction::Edit, "anything"));
        assert!(can_access_file_path(&[PACK_FILES], FileAction::Download, "x"));
    }

    #[test]
    fn root_path_falls_back_to_generic_view() {
        let scoped = ["beacon.access.files.view.logs"];
        assert!(can_access_file_path(&scoped, FileAction::View, ""));
        assert!(!can_access_file_path(&scoped, FileAction::Edit, ""));
        assert!(!can_access_file_path(NONE, FileAction::View, ""));
    }

    #[test]
    fn any_file_view_is_union_of_global_and_scoped() {
        assert!(can_access_any_file_view(&[FILES_VIEW]));
        assert!(can_access_any_file_view(&["beacon.access.files.view.logs"]));
        assert!(!can_access_any_file_view(&[FILES_EDIT]));
    }

    #[test]
    fn grants_follow_packs() {
        let grants = SessionGrants::derive(&[PACK_DASHBOARD, PACK_CONSOLE]);
        assert!(grants.can_stop_server);
        assert!(grants.can_use_console);
        assert!(!grants.can_kick_players);
        assert!(!grants.can_view_access);
    }

    #[test]
    fn all_nodes_is_sorted_and_unique() {
        let nodes = all_nodes();
        assert!(nodes.windows(2).all(|w| w[0] < w[1]));
        assert!(nodes.contains(&FILES_DOWNLOAD));
    }
}

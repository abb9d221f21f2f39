//! Matching of well-known user folders between a Windows user profile and
//! the Linux home directory. Runs unprivileged against mounted paths.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const KNOWN_FOLDERS: [&str; 6] = ["Desktop", "Documents", "Downloads", "Music", "Pictures", "Videos"];

/// Profiles under `Users` that never belong to a person.
pub const SYSTEM_PROFILES: [&str; 5] = ["Public", "Default", "Default User", "All Users", "defaultuser0"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFolder {
    pub name: String,
    pub linux_path: String,
    pub windows_path: Option<String>,
    pub exists_linux: bool,
    pub exists_windows: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMapping {
    pub linux_path: String,
    pub windows_path: String,
    pub folder_type: String,
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// The known folders of `home`, paired with their Windows counterparts
/// when a Windows profile is given.
pub fn detect_user_folders(home: &Path, windows_user_root: Option<&Path>) -> Vec<UserFolder> {
    KNOWN_FOLDERS
        .iter()
        .map(|name| {
            let linux_path = home.join(name);
            let windows_path = windows_user_root.map(|root| root.join(name));
            UserFolder {
                name: name.to_string(),
                exists_linux: linux_path.is_dir(),
                exists_windows: windows_path.as_deref().is_some_and(Path::is_dir),
                linux_path: display(&linux_path),
                windows_path: windows_path.as_deref().map(display),
            }
        })
        .collect()
}

pub fn is_system_profile(name: &str) -> bool {
    SYSTEM_PROFILES
        .iter()
        .any(|profile| profile.eq_ignore_ascii_case(name))
}

/// Real user profiles under `<windows_base>/Users`, sorted by name.
pub fn detect_windows_users(windows_base: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(windows_base.join("Users")) else {
        return Vec::new();
    };
    let mut users: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !is_system_profile(name) && !name.starts_with('.'))
        .collect();
    users.sort();
    users
}

/// Chooses the profile to map: the given one when it exists, otherwise the
/// first real user.
pub fn resolve_windows_user(windows_base: &Path, username: Option<&str>) -> Option<String> {
    match username.map(str::trim).filter(|u| !u.is_empty()) {
        Some(name) => windows_base
            .join("Users")
            .join(name)
            .is_dir()
            .then(|| name.to_string()),
        None => detect_windows_users(windows_base).into_iter().next(),
    }
}

pub fn windows_user_root(windows_base: &Path, username: &str) -> PathBuf {
    windows_base.join("Users").join(username)
}

/// One mapping per known folder that exists on the Windows side.
pub fn suggest_folder_mappings(windows_base: &Path, username: Option<&str>, home: &Path) -> Vec<FolderMapping> {
    let Some(user) = resolve_windows_user(windows_base, username) else {
        return Vec::new();
    };
    let root = windows_user_root(windows_base, &user);
    detect_user_folders(home, Some(root.as_path()))
        .into_iter()
        .filter(|folder| folder.exists_windows)
        .filter_map(|folder| {
            Some(FolderMapping {
                windows_path: folder.windows_path?,
                linux_path: folder.linux_path,
                folder_type: folder.name.to_lowercase(),
            })
        })
        .collect()
}

pub mod automap;
pub mod cancel;
pub mod classify;
pub mod commands;
pub mod config;
pub mod error;
pub mod fstab;
pub mod helper;
pub mod mapping;
pub mod partitions;
pub mod privileged;
pub mod protocol;
pub mod registry;

use tauri::Manager;

use commands::AppState;
use config::{ConfigStore, CONFIG_FILE};
pub use error::{Error, Result};

fn log_plugin<R: tauri::Runtime>() -> tauri::plugin::TauriPlugin<R> {
    use tauri_plugin_log::{Target, TargetKind};

    let crate_level = if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    tauri_plugin_log::Builder::new()
        .targets([
            Target::new(TargetKind::Stdout),
            Target::new(TargetKind::LogDir { file_name: None }),
        ])
        .level(log::LevelFilter::Info)
        .level_for("lindy_lib", crate_level)
        .build()
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let app = tauri::Builder::default()
        .plugin(log_plugin())
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_dialog::init())
        .setup(|app| {
            let config = match app.path().app_config_dir() {
                Ok(dir) => ConfigStore::load(dir.join(CONFIG_FILE)),
                Err(err) => {
                    log::warn!("no config directory, settings won't persist: {err}");
                    ConfigStore::in_memory()
                }
            };
            let resource_dir = app.path().resource_dir().ok();
            app.manage(AppState::new(config, resource_dir));
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::list_partitions,
            commands::is_valid_partition_id,
            commands::generate_preview_line,
            commands::preview_lines,
            commands::list_blocks,
            commands::apply_mappings,
            commands::retry_apply_with_force,
            commands::adopt_block,
            commands::remove_mapping,
            commands::retry_remove_with_force,
            commands::detect_user_folders,
            commands::suggest_folder_mappings,
            commands::apply_guided,
            commands::auto_map,
            commands::get_config,
            commands::update_config,
            commands::toggle_theme_mode,
            commands::cycle_accent,
            commands::get_operations_log,
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application");

    app.run(|handle, event| {
        if let tauri::RunEvent::Exit = event {
            if let Some(state) = handle.try_state::<AppState>() {
                state.tear_down();
            }
        }
    });
}

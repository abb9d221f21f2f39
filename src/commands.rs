//! Tauri commands. Everything that may wait on the elevation prompt or on
//! `lsblk` runs on the blocking pool and resolves to a structured value.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tauri::State;

use crate::automap::{self, AutoMapOutcome, FolderMapping, UserFolder};
use crate::classify::ErrorDetails;
use crate::config::{AppConfig, ConfigStore};
use crate::fstab::ledger::now_secs;
use crate::fstab::preview;
use crate::fstab::{validate_partition_id, BlockId, FstabBlock, PartitionChoice};
use crate::helper::PkexecHelper;
use crate::mapping::Mapping;
use crate::partitions::{Partition, PartitionDirectory};
use crate::protocol::adopt::{self, AdoptOutcome};
use crate::protocol::apply::{self, ApplyOutcome, ApplyRequest};
use crate::protocol::remove::{self, RemovalRequest, RemovalState};
use crate::protocol::{Failure, InFlightTargets, NextAction};
use crate::registry::{BlockRegistry, RegistrySource};

pub const OPERATIONS_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationEntry {
    pub at: u64,
    pub message: String,
}

/// Most recent operation messages, newest first.
#[derive(Debug, Default)]
pub struct OperationsLog {
    entries: Mutex<VecDeque<OperationEntry>>,
}

impl OperationsLog {
    pub fn push(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{message}");
        if let Ok(mut entries) = self.entries.lock() {
            entries.push_front(OperationEntry {
                at: now_secs(),
                message,
            });
            entries.truncate(OPERATIONS_LOG_CAPACITY);
        }
    }

    pub fn entries(&self) -> Vec<OperationEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Managed state shared by every command.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub registry: Arc<BlockRegistry>,
    pub partitions: Arc<PartitionDirectory>,
    pub in_flight: InFlightTargets,
    pub operations: Arc<OperationsLog>,
    // busy removals waiting for the user to confirm a forced retry
    pending_removals: Arc<Mutex<HashMap<String, RemovalState>>>,
    // written blocks whose activation hit busy targets, by block id
    pending_applies: Arc<Mutex<HashMap<String, ApplyRequest>>>,
    resource_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(config: ConfigStore, resource_dir: Option<PathBuf>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(BlockRegistry::new()),
            partitions: Arc::new(PartitionDirectory::new()),
            in_flight: InFlightTargets::new(),
            operations: Arc::new(OperationsLog::default()),
            pending_removals: Arc::new(Mutex::new(HashMap::new())),
            pending_applies: Arc::new(Mutex::new(HashMap::new())),
            resource_dir,
        }
    }

    fn helper(&self, config: &AppConfig) -> PkexecHelper {
        PkexecHelper::new(config.helper_path.clone(), self.resource_dir.clone()).with_table_paths(
            config.fstab_path_str(),
            config.ledger_dir.to_string_lossy().to_string(),
        )
    }

    fn source(config: &AppConfig) -> RegistrySource {
        RegistrySource::new(&config.fstab_path, &config.ledger_dir)
    }

    fn refresh_registry(&self, config: &AppConfig) {
        self.registry.refresh(&Self::source(config));
    }

    /// Stops pending refreshes from committing after shutdown.
    pub fn tear_down(&self) {
        self.registry.tear_down();
        self.partitions.tear_down();
    }
}

async fn blocking<T, F>(job: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tauri::async_runtime::spawn_blocking(job)
        .await
        .map_err(|e| e.to_string())
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}

fn path_or_home(path: Option<String>) -> PathBuf {
    path.map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(home_dir)
}

fn base_or_config(base_mount: Option<String>, config: &AppConfig) -> String {
    base_mount
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| config.base_mount.clone())
}

fn nothing_to_apply(refused: crate::protocol::OperationResult) -> ApplyOutcome {
    let details = ErrorDetails {
        title: "Nothing to apply".to_string(),
        message: "Every mapping needs both a source and a target folder.".to_string(),
        solution: "Fill in at least one complete mapping, then apply again.".to_string(),
        technical: None,
    };
    ApplyOutcome::Failed(Failure::with_details(refused, details, NextAction::None))
}

fn describe_apply(outcome: &ApplyOutcome) -> String {
    match outcome {
        ApplyOutcome::Applied { id, .. } => format!("Applied block {id}"),
        ApplyOutcome::Adoptable(candidate) => {
            format!("Block {} already covers these folders and can be adopted", candidate.id)
        }
        ApplyOutcome::Failed(failure) => format!("Apply failed: {}", failure.details.title),
    }
}

fn describe_removal(label: &str, state: &RemovalState) -> String {
    match state {
        RemovalState::Done { .. } => format!("Removed {label}"),
        RemovalState::BusyRetryOffered { .. } => format!("{label} is busy; forced removal offered"),
        RemovalState::Failed { failure } => format!("Removing {label} failed: {}", failure.details.title),
        other => format!("Removal of {label} left in state {}", other.name()),
    }
}

fn removal_key(target: Option<&str>, block_id: Option<&str>) -> Option<String> {
    target
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| block_id.map(str::trim).filter(|id| !id.is_empty()))
        .map(str::to_string)
}

fn parse_optional_id(block_id: Option<&str>) -> Result<Option<BlockId>, String> {
    match block_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => BlockId::parse(id).map(Some).map_err(|e| e.to_string()),
        None => Ok(None),
    }
}

#[tauri::command]
pub async fn list_partitions(state: State<'_, AppState>) -> Result<Vec<Partition>, String> {
    let state = state.inner().clone();
    blocking(move || state.partitions.refresh())
        .await?
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn is_valid_partition_id(value: String) -> bool {
    validate_partition_id(&value)
}

#[tauri::command]
pub fn generate_preview_line(
    partition_uuid: String,
    base_mount: String,
    src: String,
    target: String,
    skip_partition_mount: bool,
) -> String {
    preview::generate_line(&partition_uuid, &base_mount, &src, &target, skip_partition_mount)
}

#[tauri::command]
pub fn preview_lines(mappings: Vec<Mapping>, partition: PartitionChoice, base_mount: String) -> Vec<String> {
    preview::preview_lines(&mappings, &partition, &base_mount)
}

#[tauri::command]
pub async fn list_blocks(state: State<'_, AppState>) -> Result<Vec<FstabBlock>, String> {
    let state = state.inner().clone();
    blocking(move || {
        let config = state.config.get();
        state.refresh_registry(&config);
        state.registry.snapshot()
    })
    .await
}

#[tauri::command]
pub async fn apply_mappings(
    state: State<'_, AppState>,
    mappings: Vec<Mapping>,
    partition: PartitionChoice,
    base_mount: Option<String>,
) -> Result<ApplyOutcome, String> {
    let state = state.inner().clone();
    blocking(move || {
        let config = state.config.get();
        let base = base_or_config(base_mount, &config);
        let request = match ApplyRequest::build(&mappings, &partition, &base) {
            Ok(request) => request,
            Err(refused) => return nothing_to_apply(refused),
        };
        let outcome = apply::apply(
            &state.helper(&config),
            &state.in_flight,
            &request,
            &config.fstab_path_str(),
        );
        settle_apply(&state, &config, request, outcome)
    })
    .await
}

#[tauri::command]
pub async fn retry_apply_with_force(state: State<'_, AppState>, id: String) -> Result<ApplyOutcome, String> {
    let id = BlockId::parse(&id).map_err(|e| e.to_string())?;
    let state = state.inner().clone();
    blocking(move || {
        let request = state
            .pending_applies
            .lock()
            .map_err(|_| "apply state unavailable".to_string())?
            .remove(id.as_str())
            .ok_or_else(|| format!("no forced retry is on offer for block {id}"))?;
        let config = state.config.get();
        let outcome = apply::retry_with_force(
            &state.helper(&config),
            &state.in_flight,
            &request,
            &config.fstab_path_str(),
        );
        Ok(settle_apply(&state, &config, request.forced(), outcome))
    })
    .await?
}

/// Logs the outcome, parks a busy activation for a later forced retry and
/// refreshes the registry unless the table was left alone.
fn settle_apply(state: &AppState, config: &AppConfig, request: ApplyRequest, outcome: ApplyOutcome) -> ApplyOutcome {
    state.operations.push(describe_apply(&outcome));
    if let Ok(mut pending) = state.pending_applies.lock() {
        match &outcome {
            ApplyOutcome::Failed(failure) if failure.next_action == NextAction::RetryWithForce => {
                pending.insert(request.id.to_string(), request);
            }
            _ => {
                pending.remove(request.id.as_str());
            }
        }
    }
    if !matches!(outcome, ApplyOutcome::Adoptable(_)) {
        state.refresh_registry(config);
    }
    outcome
}

#[tauri::command]
pub async fn adopt_block(
    state: State<'_, AppState>,
    id: String,
    targets: Vec<String>,
) -> Result<AdoptOutcome, String> {
    let id = BlockId::parse(&id).map_err(|e| e.to_string())?;
    let state = state.inner().clone();
    blocking(move || {
        let config = state.config.get();
        let outcome = adopt::adopt(&state.helper(&config), &state.in_flight, &id, &targets);
        match &outcome {
            AdoptOutcome::Adopted { id, .. } => state.operations.push(format!("Adopted block {id}")),
            AdoptOutcome::Failed(failure) => state
                .operations
                .push(format!("Adopting {id} failed: {}", failure.details.title)),
        }
        state.refresh_registry(&config);
        outcome
    })
    .await
}

#[tauri::command]
pub async fn remove_mapping(
    state: State<'_, AppState>,
    target: Option<String>,
    block_id: Option<String>,
) -> Result<RemovalState, String> {
    let key = removal_key(target.as_deref(), block_id.as_deref())
        .ok_or_else(|| "nothing to remove: give a target or a block id".to_string())?;
    let mut id = parse_optional_id(block_id.as_deref())?;
    let state = state.inner().clone();
    blocking(move || {
        let config = state.config.get();
        let known = match (&id, target.as_deref()) {
            (Some(id), _) => state.registry.block(id.as_str()),
            (None, Some(target)) => state.registry.block_for_target(target.trim()),
            (None, None) => None,
        };
        if id.is_none() {
            // the block id is only needed for the manual fallback
            id = known.as_ref().and_then(|block| BlockId::parse(&block.id).ok());
        }
        let Some(request) = RemovalRequest::new(target.as_deref(), id) else {
            return Err("nothing to remove: give a target or a block id".to_string());
        };
        let request = request.with_known_targets(known.map(|block| block.targets).unwrap_or_default());
        let outcome = remove::remove(
            &state.helper(&config),
            &state.in_flight,
            request,
            &config.fstab_path_str(),
        );
        Ok(settle_removal(&state, &config, key, outcome))
    })
    .await?
}

#[tauri::command]
pub async fn retry_remove_with_force(
    state: State<'_, AppState>,
    target: Option<String>,
    block_id: Option<String>,
) -> Result<RemovalState, String> {
    let key = removal_key(target.as_deref(), block_id.as_deref())
        .ok_or_else(|| "nothing to retry: give a target or a block id".to_string())?;
    let state = state.inner().clone();
    blocking(move || {
        let offered = state
            .pending_removals
            .lock()
            .map_err(|_| "removal state unavailable".to_string())?
            .remove(&key)
            .ok_or_else(|| format!("no forced retry is on offer for {key}"))?;
        let config = state.config.get();
        let outcome = remove::retry_with_force(
            &state.helper(&config),
            &state.in_flight,
            offered,
            &config.fstab_path_str(),
        )
        .map_err(|e| e.to_string())?;
        Ok(settle_removal(&state, &config, key, outcome))
    })
    .await?
}

/// Logs the outcome, parks a busy offer for a later forced retry and
/// refreshes the registry once the removal is over. Any other outcome
/// withdraws an earlier offer for the same key.
fn settle_removal(state: &AppState, config: &AppConfig, key: String, outcome: RemovalState) -> RemovalState {
    state.operations.push(describe_removal(&key, &outcome));
    if let Ok(mut pending) = state.pending_removals.lock() {
        if let RemovalState::BusyRetryOffered { .. } = outcome {
            pending.insert(key, outcome.clone());
        } else {
            pending.remove(&key);
        }
    }
    if outcome.is_terminal() {
        state.refresh_registry(config);
    }
    outcome
}

#[tauri::command]
pub fn detect_user_folders(home: Option<String>, windows_user_root: Option<String>) -> Vec<UserFolder> {
    let root = windows_user_root
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .map(PathBuf::from);
    automap::folders::detect_user_folders(&path_or_home(home), root.as_deref())
}

#[tauri::command]
pub fn suggest_folder_mappings(
    windows_base: String,
    username: Option<String>,
    home: Option<String>,
) -> Vec<FolderMapping> {
    automap::guided_candidates(
        &PathBuf::from(windows_base.trim()),
        username.as_deref(),
        &path_or_home(home),
    )
}

#[tauri::command]
pub async fn apply_guided(
    state: State<'_, AppState>,
    candidates: Vec<FolderMapping>,
    partition: PartitionChoice,
    base_mount: Option<String>,
) -> Result<ApplyOutcome, String> {
    let state = state.inner().clone();
    blocking(move || {
        let config = state.config.get();
        let base = base_or_config(base_mount, &config);
        let request = match automap::guided_request(&candidates, &partition, &base) {
            Ok(request) => request,
            Err(refused) => return refused,
        };
        let outcome = apply::apply(
            &state.helper(&config),
            &state.in_flight,
            &request,
            &config.fstab_path_str(),
        );
        settle_apply(&state, &config, request, outcome)
    })
    .await
}

#[tauri::command]
pub async fn auto_map(
    state: State<'_, AppState>,
    preferred_base: Option<String>,
    username: Option<String>,
) -> Result<AutoMapOutcome, String> {
    let state = state.inner().clone();
    blocking(move || {
        let config = state.config.get();
        let outcome = automap::auto_map(
            &state.helper(&config),
            &state.in_flight,
            preferred_base.as_deref(),
            username.as_deref(),
            &home_dir(),
        );
        match &outcome {
            AutoMapOutcome::Ready {
                base_mount,
                username,
                mappings,
                ..
            } => {
                state.operations.push(format!(
                    "Auto-map found {} folder(s) for {username} at {base_mount}",
                    mappings.len()
                ));
                let base = base_mount.clone();
                if let Err(err) = state.config.update(|config| config.base_mount = base) {
                    log::warn!("could not persist base mount: {err}");
                }
            }
            AutoMapOutcome::Failed(failure) => state
                .operations
                .push(format!("Auto-map failed: {}", failure.details.title)),
        }
        outcome
    })
    .await
}

#[tauri::command]
pub fn get_config(state: State<'_, AppState>) -> AppConfig {
    state.config.get()
}

#[tauri::command]
pub fn update_config(state: State<'_, AppState>, config: AppConfig) -> Result<AppConfig, String> {
    state
        .config
        .update(|current| *current = config)
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn toggle_theme_mode(state: State<'_, AppState>) -> Result<AppConfig, String> {
    state
        .config
        .update(|config| config.theme_mode = config.theme_mode.toggled())
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn cycle_accent(state: State<'_, AppState>) -> Result<AppConfig, String> {
    state
        .config
        .update(|config| config.accent = config.accent.next())
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn get_operations_log(state: State<'_, AppState>) -> Vec<OperationEntry> {
    state.operations.entries()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OperationResult, ResultCode};

    #[test]
    fn operations_log_is_bounded_and_newest_first() {
        let log = OperationsLog::default();
        for n in 0..(OPERATIONS_LOG_CAPACITY + 5) {
            log.push(format!("op {n}"));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), OPERATIONS_LOG_CAPACITY);
        assert_eq!(entries[0].message, format!("op {}", OPERATIONS_LOG_CAPACITY + 4));
        assert_eq!(entries.last().unwrap().message, "op 5");
    }

    #[test]
    fn removal_key_prefers_target() {
        assert_eq!(removal_key(Some(" /home/bob/Music "), Some("abc")).as_deref(), Some("/home/bob/Music"));
        assert_eq!(removal_key(Some(""), Some("abc")).as_deref(), Some("abc"));
        assert_eq!(removal_key(None, None), None);
    }

    #[test]
    fn block_ids_from_the_ui_are_validated() {
        assert_eq!(parse_optional_id(None).unwrap(), None);
        assert_eq!(parse_optional_id(Some("  ")).unwrap(), None);
        assert!(parse_optional_id(Some("abc123")).unwrap().is_some());
        assert!(parse_optional_id(Some("x; rm -rf /")).is_err());
    }

    fn temp_state() -> (tempfile::TempDir, AppState, AppConfig) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(ConfigStore::in_memory(), None);
        let config = AppConfig {
            fstab_path: dir.path().join("fstab"),
            ledger_dir: dir.path().join("ledger"),
            ..AppConfig::default()
        };
        std::fs::write(&config.fstab_path, "").unwrap();
        (dir, state, config)
    }

    fn busy_offer() -> RemovalState {
        let request = RemovalRequest::new(Some("/home/bob/Music"), None).unwrap();
        let result = OperationResult::error(ResultCode::PkexecFailed, "umount failed")
            .with_output("umount: /home/bob/Music: target is busy.", "");
        let mut state = RemovalState::Idle;
        state.submit(request).unwrap();
        state.resolve(result, "/etc/fstab").unwrap();
        state
    }

    #[test]
    fn later_outcomes_withdraw_a_forced_removal_offer() {
        let (_dir, state, config) = temp_state();
        let key = "/home/bob/Music".to_string();

        settle_removal(&state, &config, key.clone(), busy_offer());
        assert!(state.pending_removals.lock().unwrap().contains_key(&key));

        let done = RemovalState::Done {
            result: OperationResult::ok(ResultCode::Removed, "removed"),
        };
        settle_removal(&state, &config, key.clone(), done);
        assert!(state.pending_removals.lock().unwrap().is_empty());

        settle_removal(&state, &config, key.clone(), busy_offer());
        let failed = RemovalState::Failed {
            failure: Failure::unrecognized(OperationResult::error(ResultCode::NotFound, "gone"), NextAction::None),
        };
        settle_removal(&state, &config, key, failed);
        assert!(state.pending_removals.lock().unwrap().is_empty());
    }

    #[test]
    fn busy_activation_is_parked_until_settled() {
        let (_dir, state, config) = temp_state();
        let mappings = vec![Mapping::with_paths("/data/Music", "/home/bob/Music")];
        let request = ApplyRequest::build(&mappings, &PartitionChoice::default(), "").unwrap();
        let id = request.id.to_string();

        let busy = OperationResult::error(ResultCode::Busy, "busy").with_id(id.clone());
        let outcome = apply::interpret(&request, busy, "/etc/fstab");
        settle_apply(&state, &config, request.clone(), outcome);
        assert_eq!(state.pending_applies.lock().unwrap().get(&id), Some(&request));

        let applied = apply::interpret(
            &request.forced(),
            OperationResult::ok(ResultCode::Applied, "ok").with_id(id.clone()),
            "/etc/fstab",
        );
        settle_apply(&state, &config, request.forced(), applied);
        assert!(state.pending_applies.lock().unwrap().is_empty());
    }

    #[test]
    fn ui_base_mount_overrides_config() {
        let config = AppConfig::default();
        assert_eq!(base_or_config(Some(" /mnt/w ".into()), &config), "/mnt/w");
        assert_eq!(base_or_config(Some("".into()), &config), "/mnt/shared");
        assert_eq!(base_or_config(None, &config), "/mnt/shared");
    }
}

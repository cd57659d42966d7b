//! Method table.
//!
//! Each method is a chain: optional guards (usually the unlocked check)
//! followed by one handler. Handlers capture the session key once at the
//! start and use it to the end, even if the wallet locks meanwhile.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::actions::{guard, handler, parse, reply, ActionRegistry, CallerMeta, Step};
use crate::approval::PermissionPatch;
use crate::crypto::SessionKey;
use crate::history::OperationType;
use crate::identity::{CreateIdentityRequest, IdentityView};
use crate::onboarding::InitializationStep;
use crate::requests::{RequestDecision, RequestType};
use crate::types::{Result, WalletError};

use super::proof::{self, CircuitPaths, ProofRequest};
use super::Services;

/// Method names as they appear on the wire.
pub mod method {
    pub const SETUP_PASSWORD: &str = "setup-password";
    pub const UNLOCK: &str = "unlock";
    pub const LOCK: &str = "lock";
    pub const GET_STATUS: &str = "get-status";
    pub const FINISH_ONBOARDING: &str = "finish-onboarding";

    pub const GET_PENDING_REQUESTS: &str = "get-pending-requests";
    pub const FINALIZE_REQUEST: &str = "finalize-request";
    pub const CONSENT_SURFACE_CLOSED: &str = "consent-surface-closed";

    pub const CREATE_IDENTITY: &str = "create-identity";
    pub const GET_COMMITMENTS: &str = "get-commitments";
    pub const GET_IDENTITIES: &str = "get-identities";
    pub const GET_ACTIVE_IDENTITY: &str = "get-active-identity";
    pub const SET_ACTIVE_IDENTITY: &str = "set-active-identity";
    pub const SET_IDENTITY_NAME: &str = "set-identity-name";
    pub const DELETE_IDENTITY: &str = "delete-identity";
    pub const DELETE_ALL_IDENTITIES: &str = "delete-all-identities";

    pub const CONNECT: &str = "connect";
    pub const APPROVE_HOST: &str = "approve-host";
    pub const IS_HOST_APPROVED: &str = "is-host-approved";
    pub const REMOVE_HOST: &str = "remove-host";
    pub const GET_HOST_PERMISSIONS: &str = "get-host-permissions";
    pub const SET_HOST_PERMISSIONS: &str = "set-host-permissions";

    pub const PREPARE_PROOF_REQUEST: &str = "prepare-proof-request";

    pub const GET_HISTORY: &str = "get-history";
    pub const DELETE_HISTORY_OPERATION: &str = "delete-history-operation";
    pub const CLEAR_HISTORY: &str = "clear-history";

    pub const DOWNLOAD_BACKUP: &str = "download-backup";
    pub const UPLOAD_BACKUP: &str = "upload-backup";

    // dev mode only
    pub const CLEAR_APPROVED_HOSTS: &str = "clear-approved-hosts";
    pub const DUMMY_REQUEST: &str = "dummy-request";
}

/// Whether a successful call counts as user activity for auto-lock.
/// Reads and page-originated calls are passive so a polling page cannot
/// keep the wallet unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    User,
    Passive,
}

#[derive(Default)]
pub(super) struct MethodTable {
    pub registry: ActionRegistry,
    pub activity: HashSet<&'static str>,
}

impl MethodTable {
    fn add(&mut self, name: &'static str, activity: Activity, steps: Vec<Step>) -> Result<()> {
        self.registry.register(name, steps)?;
        if activity == Activity::User {
            self.activity.insert(name);
        }
        Ok(())
    }
}

pub(super) fn register_all(s: &Services, dev_mode: bool) -> Result<MethodTable> {
    let mut t = MethodTable::default();

    // session
    t.add(method::SETUP_PASSWORD, Activity::User, vec![bind(s, setup_password)])?;
    t.add(method::UNLOCK, Activity::User, vec![bind(s, unlock)])?;
    t.add(method::LOCK, Activity::User, vec![bind(s, lock)])?;
    t.add(method::GET_STATUS, Activity::Passive, vec![bind(s, get_status)])?;
    t.add(method::FINISH_ONBOARDING, Activity::User, vec![ensure(s), bind(s, finish_onboarding)])?;

    // consent queue
    t.add(method::GET_PENDING_REQUESTS, Activity::Passive, vec![ensure(s), bind(s, get_pending_requests)])?;
    t.add(method::FINALIZE_REQUEST, Activity::User, vec![ensure(s), bind(s, finalize_request)])?;
    t.add(method::CONSENT_SURFACE_CLOSED, Activity::User, vec![bind(s, consent_surface_closed)])?;

    // identities
    t.add(method::CREATE_IDENTITY, Activity::User, vec![ensure(s), bind(s, create_identity)])?;
    t.add(method::GET_COMMITMENTS, Activity::Passive, vec![ensure(s), bind(s, get_commitments)])?;
    t.add(method::GET_IDENTITIES, Activity::Passive, vec![ensure(s), bind(s, get_identities)])?;
    t.add(method::GET_ACTIVE_IDENTITY, Activity::Passive, vec![ensure(s), bind(s, get_active_identity)])?;
    t.add(method::SET_ACTIVE_IDENTITY, Activity::User, vec![ensure(s), bind(s, set_active_identity)])?;
    t.add(method::SET_IDENTITY_NAME, Activity::User, vec![ensure(s), bind(s, set_identity_name)])?;
    t.add(method::DELETE_IDENTITY, Activity::User, vec![ensure(s), bind(s, delete_identity)])?;
    t.add(method::DELETE_ALL_IDENTITIES, Activity::User, vec![ensure(s), bind(s, delete_all_identities)])?;

    // hosts
    t.add(method::CONNECT, Activity::Passive, vec![bind(s, connect)])?;
    t.add(method::APPROVE_HOST, Activity::User, vec![ensure(s), bind(s, approve_host)])?;
    t.add(method::IS_HOST_APPROVED, Activity::Passive, vec![ensure(s), bind(s, is_host_approved)])?;
    t.add(method::REMOVE_HOST, Activity::User, vec![ensure(s), bind(s, remove_host)])?;
    t.add(method::GET_HOST_PERMISSIONS, Activity::Passive, vec![ensure(s), bind(s, get_host_permissions)])?;
    t.add(method::SET_HOST_PERMISSIONS, Activity::User, vec![ensure(s), bind(s, set_host_permissions)])?;

    // proofs
    t.add(method::PREPARE_PROOF_REQUEST, Activity::Passive, vec![ensure(s), bind(s, prepare_proof_request)])?;

    // history
    t.add(method::GET_HISTORY, Activity::Passive, vec![ensure(s), bind(s, get_history)])?;
    t.add(method::DELETE_HISTORY_OPERATION, Activity::User, vec![ensure(s), bind(s, delete_history_operation)])?;
    t.add(method::CLEAR_HISTORY, Activity::User, vec![ensure(s), bind(s, clear_history)])?;

    // backup
    t.add(method::DOWNLOAD_BACKUP, Activity::User, vec![ensure(s), bind(s, download_backup)])?;
    t.add(method::UPLOAD_BACKUP, Activity::User, vec![bind(s, upload_backup)])?;

    if dev_mode {
        t.add(method::CLEAR_APPROVED_HOSTS, Activity::User, vec![ensure(s), bind(s, clear_approved_hosts)])?;
        t.add(method::DUMMY_REQUEST, Activity::Passive, vec![bind(s, dummy_request)])?;
    }

    Ok(t)
}

fn ensure(s: &Services) -> Step {
    let lock = Arc::clone(&s.lock);
    guard(move |_, _| lock.ensure())
}

fn bind<F, Fut>(s: &Services, f: F) -> Step
where
    F: Fn(Services, Value, CallerMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let s = s.clone();
    handler(move |payload, meta| f(s.clone(), payload, meta))
}

/// Like [`parse`], but a missing payload means "all defaults".
fn parse_or_default<T: DeserializeOwned + Default>(payload: Value) -> Result<T> {
    match payload {
        Value::Null => Ok(T::default()),
        payload => parse(payload),
    }
}

/// History is best effort: a failed write is logged, never returned.
async fn record(s: &Services, kind: OperationType, identity: Option<&IdentityView>, key: &SessionKey) {
    if let Err(e) = s.history.track(kind, identity, key).await {
        warn!(?kind, error = %e, "Failed to record history");
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Deserialize)]
struct PasswordPayload {
    password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizePayload {
    id: String,
    status: RequestDecision,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct CommitmentPayload {
    commitment: String,
}

#[derive(Deserialize)]
struct RenamePayload {
    commitment: String,
    name: String,
}

#[derive(Deserialize, Default)]
struct ConnectPayload {
    #[serde(default)]
    origin: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveHostPayload {
    host: String,
    #[serde(default)]
    can_skip_approve: bool,
}

#[derive(Deserialize)]
struct HostPayload {
    host: String,
}

#[derive(Deserialize)]
struct SetPermissionsPayload {
    host: String,
    #[serde(flatten)]
    patch: PermissionPatch,
}

#[derive(Deserialize, Default)]
struct HistoryQuery {
    #[serde(default, rename = "type")]
    kind: Option<OperationType>,
}

#[derive(Deserialize)]
struct OperationIdPayload {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadPayload {
    content: String,
    #[serde(default)]
    password: String,
    backup_password: String,
}

// =============================================================================
// Session
// =============================================================================

async fn setup_password(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let p: PasswordPayload = parse(payload)?;
    s.lock.setup_password(&p.password).await?;
    s.initialization.advance_to(InitializationStep::Password).await?;
    reply(true)
}

async fn unlock(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let p: PasswordPayload = parse(payload)?;
    s.lock.unlock(&p.password).await?;
    reply(true)
}

async fn lock(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    s.lock.lock().await?;
    reply(true)
}

async fn get_status(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    reply(s.lock.status())
}

async fn finish_onboarding(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    let step = s.initialization.advance_to(InitializationStep::Done).await?;
    reply(step)
}

// =============================================================================
// Consent queue
// =============================================================================

async fn get_pending_requests(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    reply(s.broker.pending())
}

async fn finalize_request(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let p: FinalizePayload = parse(payload)?;
    s.broker.finalize_request(&p.id, p.status, p.data)?;
    reply(true)
}

async fn consent_surface_closed(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    reply(s.broker.surface_closed())
}

// =============================================================================
// Identities
// =============================================================================

async fn create_identity(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    let request: CreateIdentityRequest = parse(payload)?;
    let identity = s.vault.create(&request, &key).await?;
    record(&s, OperationType::CreateIdentity, Some(&identity), &key).await;
    reply(identity)
}

async fn get_commitments(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    reply(s.vault.commitments().await?)
}

async fn get_identities(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    reply(s.vault.identities().await?)
}

async fn get_active_identity(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    let active = s.vault.active().await?;
    reply(active.map(|identity| identity.view()))
}

async fn set_active_identity(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    let p: CommitmentPayload = parse(payload)?;
    s.vault.set_active(&p.commitment, &key).await?;
    reply(true)
}

async fn set_identity_name(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    let p: RenamePayload = parse(payload)?;
    s.vault.set_name(&p.commitment, &p.name, &key).await?;
    reply(true)
}

async fn delete_identity(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    let p: CommitmentPayload = parse(payload)?;
    let removed = s.vault.delete(&p.commitment, &key).await?;
    record(&s, OperationType::DeleteIdentity, Some(&removed), &key).await;
    reply(true)
}

async fn delete_all_identities(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    let count = s.vault.delete_all(&key).await?;
    record(&s, OperationType::DeleteAllIdentities, None, &key).await;
    reply(count)
}

// =============================================================================
// Hosts
// =============================================================================

/// A page asks to connect. Waits for unlock if needed, then asks the user
/// unless the origin is already approved.
async fn connect(s: Services, payload: Value, meta: CallerMeta) -> Result<Value> {
    let p: ConnectPayload = parse_or_default(payload)?;
    let origin = p.origin.unwrap_or(meta.origin);
    if origin.is_empty() {
        return Err(WalletError::BadRequest("Origin not provided".into()));
    }

    let prompted = !s.lock.status().unlocked;
    if prompted {
        debug!(origin = %origin, "Connect while locked, waiting for unlock");
        s.broker.prompt();
        s.lock.wait_unlocked().await?;
    }

    if s.approvals.is_approved(&origin) {
        if prompted {
            // the surface was only needed for the password
            s.broker.release_prompt();
        }
        let permission = s.approvals.get_permission(&origin);
        return reply(json!({
            "isApproved": true,
            "canSkipApprove": permission.can_skip_approve,
        }));
    }

    let outcome = s
        .broker
        .new_request(RequestType::Connect, json!({ "origin": origin }), &origin)
        .await?;
    match outcome.decision {
        RequestDecision::Approved => {
            let can_skip_approve = outcome
                .data
                .as_ref()
                .and_then(|data| data.get("canSkipApprove"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let key = s.lock.session_key()?;
            s.approvals.add(&origin, can_skip_approve, &key).await?;
            reply(json!({ "isApproved": true, "canSkipApprove": can_skip_approve }))
        }
        RequestDecision::Rejected => reply(json!({ "isApproved": false, "canSkipApprove": false })),
    }
}

async fn approve_host(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    let p: ApproveHostPayload = parse(payload)?;
    reply(s.approvals.add(&p.host, p.can_skip_approve, &key).await?)
}

async fn is_host_approved(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let p: HostPayload = parse(payload)?;
    reply(s.approvals.is_approved(&p.host))
}

async fn remove_host(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    let p: HostPayload = parse(payload)?;
    reply(s.approvals.remove(&p.host, &key).await?)
}

async fn get_host_permissions(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let p: HostPayload = parse(payload)?;
    reply(s.approvals.get_permission(&p.host))
}

async fn set_host_permissions(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    let p: SetPermissionsPayload = parse(payload)?;
    reply(s.approvals.set_permission(&p.host, p.patch, &key).await?)
}

// =============================================================================
// Proofs
// =============================================================================

/// Validate a proof request and return the active identity for the proof
/// engine. The user is asked first unless the origin is approved with
/// consent skipping enabled.
async fn prepare_proof_request(s: Services, payload: Value, meta: CallerMeta) -> Result<Value> {
    let request: ProofRequest = parse(payload.clone())?;
    proof::validate(&request)?;
    if meta.origin.is_empty() {
        return Err(WalletError::BadRequest("Origin not provided".into()));
    }

    let identity = s
        .vault
        .active()
        .await?
        .ok_or_else(|| WalletError::NotFound("active identity".into()))?;
    let paths = CircuitPaths::new(&s.proof_artifacts_dir, request.protocol);
    let payload = proof::enrich(payload, &paths)?;

    let permission = s.approvals.get_permission(&meta.origin);
    if !(permission.approved && permission.can_skip_approve) {
        let mut consent = payload.clone();
        if let Value::Object(fields) = &mut consent {
            fields.insert("origin".into(), json!(meta.origin));
            fields.insert("approved".into(), json!(permission.approved));
        }
        s.broker
            .request_approval(request.protocol.request_type(), consent, &meta.origin)
            .await?;
    }

    reply(json!({
        "identity": identity.serialize()?,
        "payload": payload,
    }))
}

// =============================================================================
// History
// =============================================================================

async fn get_history(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let query: HistoryQuery = parse_or_default(payload)?;
    reply(s.history.operations(query.kind).await?)
}

async fn delete_history_operation(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    let p: OperationIdPayload = parse(payload)?;
    s.history.remove(&p.id, &key).await?;
    reply(true)
}

async fn clear_history(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    s.history.clear(&key).await?;
    reply(true)
}

// =============================================================================
// Backup
// =============================================================================

async fn download_backup(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    let p: PasswordPayload = parse(payload)?;
    let content = s.backup.download_json(&p.password).await?;
    record(&s, OperationType::DownloadBackup, None, &key).await;
    reply(content)
}

/// Not guarded: a fresh install restores before any password exists.
async fn upload_backup(s: Services, payload: Value, _meta: CallerMeta) -> Result<Value> {
    let p: UploadPayload = parse(payload)?;
    let uploaded = s
        .backup
        .upload(&p.content, &p.password, &p.backup_password)
        .await?;
    if let Ok(key) = s.lock.session_key() {
        record(&s, OperationType::UploadBackup, None, &key).await;
    }
    reply(uploaded)
}

// =============================================================================
// Dev mode
// =============================================================================

async fn clear_approved_hosts(s: Services, _payload: Value, _meta: CallerMeta) -> Result<Value> {
    let key = s.lock.session_key()?;
    s.approvals.clear(&key).await?;
    reply(true)
}

async fn dummy_request(s: Services, _payload: Value, meta: CallerMeta) -> Result<Value> {
    let outcome = s
        .broker
        .new_request(RequestType::Dummy, json!("hello from dummy"), &meta.origin)
        .await?;
    reply(outcome)
}

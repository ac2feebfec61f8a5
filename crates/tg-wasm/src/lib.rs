//! WebAssembly bindings for Trackguard
//!
//! Structured inputs and outputs cross the boundary as JSON strings in the
//! same camelCase shape the Rust types serialize to.

use std::sync::{Arc, OnceLock};

use tg_compiler::{parse_filter_list, plan, DesiredState, HostSnapshot, RuleCompiler};
use tg_core::{url::extract_host, PatternDatabase, PolicyState, PublicSuffixList, TrackerResolver};
use wasm_bindgen::prelude::*;

static RESOLVER: OnceLock<TrackerResolver> = OnceLock::new();
static PSL: OnceLock<Arc<PublicSuffixList>> = OnceLock::new();

fn psl() -> Arc<PublicSuffixList> {
    PSL.get_or_init(|| Arc::new(PublicSuffixList::default())).clone()
}

fn resolver() -> &'static TrackerResolver {
    RESOLVER.get_or_init(|| TrackerResolver::new(None, psl()))
}

fn js_error(context: &str, err: impl std::fmt::Display) -> JsValue {
    let message = format!("{context}: {err}");
    web_sys::console::error_1(&JsValue::from_str(&message));
    JsValue::from_str(&message)
}

/// Load (or replace) the pattern database from its JSON source.
#[wasm_bindgen]
pub fn init_database(json: &str) -> Result<JsValue, JsValue> {
    let database = PatternDatabase::from_json(json).map_err(|e| js_error("Failed to load pattern database", e))?;

    let result = js_sys::Object::new();
    let _ = js_sys::Reflect::set(&result, &"version".into(), &JsValue::from(database.version()));
    let _ = js_sys::Reflect::set(&result, &"trackers".into(), &JsValue::from(database.tracker_count() as u32));

    let invalid = js_sys::Array::new();
    for pattern in database.invalid_regexes() {
        invalid.push(&JsValue::from_str(pattern));
    }
    let _ = js_sys::Reflect::set(&result, &"invalidRegexes".into(), &invalid);

    resolver().replace_database(Arc::new(database));
    Ok(result.into())
}

/// Load a Public Suffix List (`.dat` text). Must run before the first lookup.
#[wasm_bindgen]
pub fn init_psl(text: &str) -> Result<(), JsValue> {
    PSL.set(Arc::new(PublicSuffixList::from_text(text)))
        .map_err(|_| JsValue::from_str("Public suffix list already initialized"))
}

#[wasm_bindgen]
pub fn is_initialized() -> bool {
    RESOLVER.get().is_some_and(|r| r.database().is_some())
}

/// Tracker behind `url`, or `null`.
#[wasm_bindgen]
pub fn resolve(url: &str, origin_hostname: Option<String>) -> JsValue {
    let Some(found) = resolver().resolve(url, origin_hostname.as_deref()) else {
        return JsValue::NULL;
    };

    let result = js_sys::Object::new();
    let _ = js_sys::Reflect::set(&result, &"trackerId".into(), &JsValue::from_str(&found.tracker.id));
    let _ = js_sys::Reflect::set(&result, &"name".into(), &JsValue::from_str(&found.tracker.name));
    if let Some(category) = &found.category {
        let _ = js_sys::Reflect::set(&result, &"category".into(), &JsValue::from_str(&category.id));
    }
    if let Some(organization) = &found.organization {
        let _ = js_sys::Reflect::set(&result, &"organization".into(), &JsValue::from_str(&organization.name));
    }
    let layer = serde_json::to_value(found.layer)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let _ = js_sys::Reflect::set(&result, &"layer".into(), &JsValue::from_str(&layer));
    result.into()
}

/// Compile a policy document into rules. Returns the compiled JSON.
#[wasm_bindgen]
pub fn compile_rules(policy_json: &str, now_ms: f64) -> Result<String, JsValue> {
    let state: PolicyState = serde_json::from_str(policy_json).map_err(|e| js_error("Invalid policy state", e))?;
    let compiled = RuleCompiler::new(resolver().database()).compile(&state, now_ms as u64);
    compiled.to_json().map_err(|e| js_error("Failed to serialize rules", e))
}

/// Plan the host calls that move `snapshot` to `desired`.
#[wasm_bindgen]
pub fn plan_reconcile(desired_json: &str, snapshot_json: &str) -> Result<String, JsValue> {
    let desired: DesiredState = serde_json::from_str(desired_json).map_err(|e| js_error("Invalid desired state", e))?;
    let snapshot: HostSnapshot =
        serde_json::from_str(snapshot_json).map_err(|e| js_error("Invalid host snapshot", e))?;
    serde_json::to_string(&plan(&desired, &snapshot)).map_err(|e| js_error("Failed to serialize plan", e))
}

/// Per-line errors for custom filter text, for the settings editor.
#[wasm_bindgen]
pub fn validate_custom_filters(text: &str) -> Result<String, JsValue> {
    let parsed = parse_filter_list(text);
    serde_json::to_string(&parsed.errors).map_err(|e| js_error("Failed to serialize errors", e))
}

#[wasm_bindgen]
pub fn get_etld1_js(host: &str) -> String {
    psl().get_etld1(host)
}

#[wasm_bindgen]
pub fn is_same_site(host1: &str, host2: &str) -> bool {
    psl().is_same_site(host1, host2)
}

#[wasm_bindgen]
pub fn extract_host_js(url: &str) -> Option<String> {
    extract_host(url).map(|h| h.to_string())
}

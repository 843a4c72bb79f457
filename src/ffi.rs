//! C ABI for embedding (Android/iOS/desktop hosts)
//!
//! Strings returned by these functions are owned by the library and must be
//! handed back to [`ech_tunnel_free_string`].

use crate::config::ServerConfig;
use crate::controller::{ControlOutcome, ServiceController};
use std::ffi::{c_char, c_int, CStr, CString};
use std::sync::OnceLock;
use tokio::runtime::Runtime;

static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();
static CONTROLLER: OnceLock<ServiceController> = OnceLock::new();

fn get_runtime() -> Option<&'static Runtime> {
    RUNTIME
        .get_or_init(|| {
            match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("ech-tunnel")
                .build()
            {
                Ok(rt) => Some(rt),
                Err(e) => {
                    tracing::error!("Failed to create Tokio runtime: {}", e);
                    None
                }
            }
        })
        .as_ref()
}

fn get_controller() -> &'static ServiceController {
    CONTROLLER.get_or_init(ServiceController::new)
}

fn into_c_string(value: String) -> *mut c_char {
    // Interior NULs cannot cross the boundary; JSON output never has them.
    match CString::new(value) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

fn outcome_json(outcome: &ControlOutcome) -> *mut c_char {
    into_c_string(serde_json::to_string(outcome).unwrap_or_else(|_| {
        format!(r#"{{"success":{},"message":""}}"#, outcome.success)
    }))
}

fn failure(message: impl Into<String>) -> *mut c_char {
    outcome_json(&ControlOutcome {
        success: false,
        message: message.into(),
    })
}

/// Start the tunnel from a JSON `ServerConfig`.
///
/// Returns a JSON `{"success": bool, "message": string}` to be released with
/// `ech_tunnel_free_string`.
///
/// # Safety
/// `config_json` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ech_tunnel_start(config_json: *const c_char) -> *mut c_char {
    ech_tunnel_init_logging();

    let json = if config_json.is_null() {
        "{}".to_string()
    } else {
        match CStr::from_ptr(config_json).to_str() {
            Ok(s) if !s.trim().is_empty() => s.to_string(),
            Ok(_) => "{}".to_string(),
            Err(_) => return failure("config is not valid UTF-8"),
        }
    };

    let config = match ServerConfig::from_json(&json) {
        Ok(config) => config,
        Err(e) => return failure(e.to_string()),
    };
    let Some(rt) = get_runtime() else {
        return failure("async runtime unavailable");
    };

    let outcome = rt.block_on(get_controller().start(config));
    outcome_json(&outcome)
}

/// Stop the tunnel. Returns the same JSON shape as `ech_tunnel_start`.
#[no_mangle]
pub extern "C" fn ech_tunnel_stop() -> *mut c_char {
    let Some(rt) = get_runtime() else {
        return failure("async runtime unavailable");
    };
    let outcome = rt.block_on(get_controller().stop());
    outcome_json(&outcome)
}

/// Returns 1 if running, 0 if not
#[no_mangle]
pub extern "C" fn ech_tunnel_is_running() -> c_int {
    match CONTROLLER.get() {
        Some(controller) if controller.is_running() => 1,
        _ => 0,
    }
}

/// Current counters as JSON
#[no_mangle]
pub extern "C" fn ech_tunnel_get_stats() -> *mut c_char {
    into_c_string(get_controller().stats().to_string())
}

/// Release a string returned by this library.
///
/// # Safety
/// `s` must come from this library and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn ech_tunnel_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Stop everything and refuse further starts. Blocks until quiescent.
#[no_mangle]
pub extern "C" fn ech_tunnel_release() {
    if let (Some(rt), Some(controller)) = (get_runtime(), CONTROLLER.get()) {
        rt.block_on(controller.release());
        tracing::info!("ECH tunnel released");
    }
}

/// Initialize logging (safe to call more than once)
#[no_mangle]
pub extern "C" fn ech_tunnel_init_logging() {
    #[cfg(target_os = "android")]
    {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;
        let mut filter = EnvFilter::from_default_env();
        for directive in [
            "ech_tunnel=info",
            "rustls=warn",
            "hickory_resolver=info",
            "hickory_proto=warn",
            "reqwest=warn",
        ] {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
        if let Ok(layer) = tracing_android::layer("EchTunnel") {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init();
        }
    }

    #[cfg(not(target_os = "android"))]
    {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false))
            .with(
                EnvFilter::from_default_env()
                    .add_directive("ech_tunnel=info".parse().unwrap_or_default()),
            )
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take(s: *mut c_char) -> serde_json::Value {
        assert!(!s.is_null());
        let text = unsafe { CStr::from_ptr(s) }.to_str().unwrap().to_string();
        unsafe { ech_tunnel_free_string(s) };
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn bad_json_is_reported_not_panicked() {
        let config = CString::new("{not json").unwrap();
        let outcome = take(unsafe { ech_tunnel_start(config.as_ptr()) });
        assert_eq!(outcome["success"], false);
        assert!(!outcome["message"].as_str().unwrap().is_empty());
    }

    #[test]
    fn stats_are_json_even_when_idle() {
        let stats = take(ech_tunnel_get_stats());
        assert!(stats.get("acceptor").is_some());
    }

    #[test]
    fn null_is_a_valid_free() {
        unsafe { ech_tunnel_free_string(std::ptr::null_mut()) };
    }
}

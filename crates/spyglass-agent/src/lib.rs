//! Spyglass Agent
//!
//! The in-process component: once loaded into a host application it starts a
//! WebSocket endpoint on loopback and routes structured commands into the
//! core engine. The loader's lifecycle hook is the only initializer; startup
//! happens on a worker thread so the load call returns immediately.

pub mod engine;
pub mod router;
pub mod server;
pub mod ws;

pub use engine::Engine;
pub use router::{CommandRouter, RequestContext};
pub use server::{WebSocketServer, SERVER_PORT};

use parking_lot::Mutex;
use spyglass_common::{error, info, init_agent_logging};
use std::sync::Arc;

struct AgentRuntime {
    engine: Arc<Engine>,
    server: WebSocketServer,
}

static AGENT: Mutex<Option<AgentRuntime>> = Mutex::new(None);

/// Install a panic hook that reports instead of unwinding into the host.
fn install_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        error!(target: "spyglass_agent::panic", message = %payload, location = %location, "panic in agent");
    }));
}

/// Start the agent on a worker thread. Idempotent; safe to call from a
/// loader entry point that must return quickly.
pub fn init() {
    std::thread::spawn(|| {
        init_agent_logging();
        install_panic_handler();
        if let Err(e) = start_agent() {
            error!(target: "spyglass_agent", error = %e, "agent initialization failed");
        }
    });
}

fn start_agent() -> std::io::Result<()> {
    let mut slot = AGENT.lock();
    if slot.is_some() {
        info!(target: "spyglass_agent", "agent already running");
        return Ok(());
    }

    info!(target: "spyglass_agent", pid = std::process::id(), "agent starting");

    let engine = Engine::new();
    let router = Arc::new(CommandRouter::new(Arc::clone(&engine)));
    let server = WebSocketServer::start(Arc::clone(&engine), router, server::default_addr())?;

    info!(
        target: "spyglass_agent",
        address = %server.local_addr(),
        "agent ready"
    );

    *slot = Some(AgentRuntime { engine, server });
    Ok(())
}

/// Stop the agent: server first (terminating connections and worker
/// threads), then live hooks, then the rest.
pub fn shutdown() {
    let runtime = AGENT.lock().take();
    if let Some(runtime) = runtime {
        info!(target: "spyglass_agent", "agent shutting down");
        runtime.server.stop();
        runtime.engine.shutdown();
        info!(target: "spyglass_agent", "agent shut down");
    }
}

/// DLL entry point: spawn the worker and return immediately.
#[cfg(windows)]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn DllMain(
    _hinst: windows::Win32::Foundation::HINSTANCE,
    reason: u32,
    _reserved: *mut std::ffi::c_void,
) -> i32 {
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    match reason {
        DLL_PROCESS_ATTACH => init(),
        DLL_PROCESS_DETACH => shutdown(),
        _ => {}
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_without_init_is_noop() {
        shutdown();
        assert!(AGENT.lock().is_none());
    }
}

//! Command router
//!
//! Parses the JSON envelope (`command`, optional `id`, parameters), invokes
//! the registered handler and produces the response envelope. Handler errors
//! never escape: they become `success=false` with the error text. The `id`
//! is echoed verbatim whenever the request carried one.
//!
//! Addresses are `0x`-prefixed hex strings in both directions. Numeric
//! parameters are accepted as JSON numbers or strings.

use crate::engine::Engine;
use serde_json::{json, Map, Value};
use spyglass_common::wire::{
    bytes_to_hex, bytes_to_string, format_address, hex_to_bytes, parse_address, value_to_bytes,
};
use spyglass_common::{
    Error, HookKind, MemoryRegion, MemoryState, MemoryType, Protection, Result, ScanKind,
    ScanOptions, ScanResult, TriState, ValueType,
};
use spyglass_core::{disasm, pattern, pointer, scanner};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cap applied to pattern and pointer result lists on the wire
const RESULT_CAP: usize = 100;
/// String reads stop at a NUL or this many bytes
const MAX_STRING_READ: usize = 256;

/// Queue handle for unsolicited broadcast frames
pub type Broadcaster = mpsc::Sender<String>;

/// Per-connection surface the router can reach: the implicit subscription
/// set behind `memory.watch` / `memory.unwatch`.
pub trait ClientSession: Send + Sync {
    fn watch(&self, address: usize, value_type: ValueType);
    fn unwatch(&self, address: usize) -> bool;
}

/// What a handler knows about the transport it was called from. Both parts
/// are absent when the router is driven outside a connection.
pub struct RequestContext<'a> {
    pub session: Option<&'a dyn ClientSession>,
    pub broadcast: Option<&'a Broadcaster>,
}

impl RequestContext<'_> {
    pub fn detached() -> Self {
        RequestContext {
            session: None,
            broadcast: None,
        }
    }
}

type Handler = fn(&Engine, &RequestContext, &Value) -> Result<Value>;

pub struct CommandRouter {
    engine: Arc<Engine>,
    commands: HashMap<&'static str, Handler>,
}

impl CommandRouter {
    pub fn new(engine: Arc<Engine>) -> Self {
        let mut router = Self {
            engine,
            commands: HashMap::new(),
        };
        router.register_builtin_commands();
        router
    }

    fn register(&mut self, command: &'static str, handler: Handler) {
        self.commands.insert(command, handler);
    }

    fn register_builtin_commands(&mut self) {
        self.register("process.info", handle_process_info);
        self.register("module.list", handle_module_list);
        self.register("module.info", handle_module_info);
        self.register("module.from_address", handle_module_from_address);
        self.register("memory.regions", handle_memory_regions);
        self.register("memory.validate", handle_memory_validate);
        self.register("memory.read", handle_memory_read);
        self.register("memory.read_value", handle_memory_read_value);
        self.register("memory.write", handle_memory_write);
        self.register("memory.scan", handle_memory_scan);
        self.register("memory.disassemble", handle_memory_disassemble);
        self.register("memory.patch", handle_memory_patch);
        self.register("memory.nop", handle_memory_nop);
        self.register("memory.allocate", handle_memory_allocate);
        self.register("memory.free", handle_memory_free);
        self.register("memory.watch", handle_memory_watch);
        self.register("memory.unwatch", handle_memory_unwatch);
        self.register("pattern.scan", handle_pattern_scan);
        self.register("pattern.scanall", handle_pattern_scan_all);
        self.register("pointer.chain", handle_pointer_chain);
        self.register("pointer.find", handle_pointer_find);
        self.register("hook.install", handle_hook_install);
        self.register("hook.remove", handle_hook_remove);
        self.register("hook.toggle", handle_hook_toggle);
        self.register("hook.list", handle_hook_list);
    }

    /// Execute one request and produce the response JSON text.
    pub fn execute(&self, raw: &str, ctx: &RequestContext) -> String {
        let request: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => return error_response(None, &format!("Invalid JSON: {}", e)),
        };
        let id = request.get("id").cloned();

        let Some(command) = request.get("command").and_then(Value::as_str) else {
            return error_response(id.as_ref(), "No command specified");
        };

        debug!(target: "spyglass_agent::router", command, "dispatching");

        match self.commands.get(command) {
            None => error_response(id.as_ref(), &format!("Unknown command: {}", command)),
            Some(handler) => match handler(&self.engine, ctx, &request) {
                Ok(data) => success_response(id.as_ref(), data),
                Err(e) => {
                    warn!(target: "spyglass_agent::router", command, error = %e, "command failed");
                    error_response(id.as_ref(), &e.to_string())
                }
            },
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

fn success_response(id: Option<&Value>, data: Value) -> String {
    let mut obj = Map::new();
    if let Some(id) = id {
        obj.insert("id".to_string(), id.clone());
    }
    obj.insert("success".to_string(), Value::Bool(true));
    obj.insert("data".to_string(), data);
    Value::Object(obj).to_string()
}

fn error_response(id: Option<&Value>, message: &str) -> String {
    let mut obj = Map::new();
    if let Some(id) = id {
        obj.insert("id".to_string(), id.clone());
    }
    obj.insert("success".to_string(), Value::Bool(false));
    obj.insert("error".to_string(), Value::String(message.to_string()));
    Value::Object(obj).to_string()
}

// ============================================================================
// Parameter helpers
// ============================================================================

fn missing(key: &str) -> Error {
    Error::InvalidParameter(format!("Missing parameter: {}", key))
}

fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(key))
}

fn param_opt_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Hex string (with or without `0x`) or JSON number.
fn param_address(params: &Value, key: &str) -> Result<usize> {
    match params.get(key) {
        Some(Value::String(s)) => parse_address(s),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| Error::InvalidParameter(format!("Bad address in {}", key))),
        _ => Err(missing(key)),
    }
}

fn param_opt_address(params: &Value, key: &str) -> Result<Option<usize>> {
    if params.get(key).is_none() || params.get(key) == Some(&Value::Null) {
        return Ok(None);
    }
    param_address(params, key).map(Some)
}

/// Decimal count as JSON number or string.
fn param_usize(params: &Value, key: &str) -> Result<usize> {
    match params.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| Error::InvalidParameter(format!("Bad number in {}", key))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidParameter(format!("Bad number in {}", key))),
        _ => Err(missing(key)),
    }
}

fn param_opt_usize(params: &Value, key: &str) -> Result<Option<usize>> {
    if params.get(key).is_none() || params.get(key) == Some(&Value::Null) {
        return Ok(None);
    }
    param_usize(params, key).map(Some)
}

fn param_opt_bool(params: &Value, key: &str) -> Option<bool> {
    match params.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => Some(s == "true"),
        _ => None,
    }
}

fn param_tri(params: &Value, key: &str) -> TriState {
    match params.get(key) {
        Some(Value::Bool(true)) => TriState::Yes,
        Some(Value::Bool(false)) => TriState::No,
        Some(Value::String(s)) => TriState::parse(s),
        _ => TriState::Any,
    }
}

fn param_value_type(params: &Value, key: &str) -> Result<ValueType> {
    param_str(params, key)?
        .parse()
        .map_err(Error::InvalidParameter)
}

/// The `value` field may arrive as a string or a bare number.
fn param_value_string(params: &Value, key: &str) -> Option<String> {
    match params.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// JSON rendering
// ============================================================================

fn protection_string(p: &Protection) -> String {
    let mut s = String::with_capacity(4);
    s.push(if p.read { 'r' } else { '-' });
    s.push(if p.write { 'w' } else { '-' });
    s.push(if p.execute { 'x' } else { '-' });
    if p.copy_on_write {
        s.push('c');
    }
    s
}

fn region_json(region: &MemoryRegion) -> Value {
    json!({
        "baseAddress": format_address(region.base),
        "size": region.size,
        "protection": protection_string(&region.protection),
        "state": match region.state {
            MemoryState::Commit => "commit",
            MemoryState::Reserve => "reserve",
            MemoryState::Free => "free",
        },
        "type": match region.region_type {
            MemoryType::Image => "image",
            MemoryType::Mapped => "mapped",
            MemoryType::Private => "private",
        },
        "readable": region.readable(),
        "writable": region.writable(),
        "executable": region.executable(),
        "moduleName": region.module_name.clone().unwrap_or_default(),
    })
}

// ============================================================================
// Handlers
// ============================================================================

fn handle_process_info(engine: &Engine, _ctx: &RequestContext, _params: &Value) -> Result<Value> {
    let info = engine.process_info();
    Ok(json!({
        "pid": info.pid,
        "name": info.name,
        "platform": info.platform,
        "addressWidth": info.address_width,
        "mainModule": {
            "baseAddress": format_address(info.main_module.base_address),
            "size": info.main_module.size,
        },
        "memoryMetrics": {
            "total": info.memory_metrics.total,
            "writable": info.memory_metrics.writable,
            "executable": info.memory_metrics.executable,
        },
    }))
}

fn handle_module_list(engine: &Engine, _ctx: &RequestContext, _params: &Value) -> Result<Value> {
    let modules: Vec<Value> = engine
        .modules
        .list()
        .iter()
        .map(|m| {
            json!({
                "name": m.name,
                "path": m.path,
                "base": format_address(m.base),
                "size": m.size,
            })
        })
        .collect();
    Ok(Value::Array(modules))
}

fn handle_module_info(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let name = param_str(params, "name")?;
    let module = engine
        .modules
        .find(name)
        .ok_or_else(|| Error::ModuleNotFound(name.to_string()))?;

    let region = engine.memory.region_at(module.base);
    let (protection, readable, writable, executable) = match &region {
        Some(r) => (
            protection_string(&r.protection),
            r.readable(),
            r.writable(),
            r.executable(),
        ),
        None => (String::new(), false, false, false),
    };

    Ok(json!({
        "name": module.name,
        "baseAddress": format_address(module.base),
        "size": module.size,
        "endAddress": format_address(module.end()),
        "protection": protection,
        "readable": readable,
        "writable": writable,
        "executable": executable,
        "path": module.path,
    }))
}

fn handle_module_from_address(
    engine: &Engine,
    _ctx: &RequestContext,
    params: &Value,
) -> Result<Value> {
    let address = param_address(params, "address")?;
    let (module, offset) = engine
        .modules
        .module_for_address(address)
        .ok_or_else(|| Error::ModuleNotFound(format!("{:#x}", address)))?;

    Ok(json!({
        "moduleName": module.name,
        "baseAddress": format_address(module.base),
        "offset": format_address(offset),
        "displayName": module.display_for(address),
    }))
}

fn handle_memory_regions(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let filter = param_opt_str(params, "filter");
    let regions: Vec<Value> = engine
        .memory
        .regions()
        .iter()
        .filter(|r| match filter {
            Some("readable") => r.readable(),
            Some("writable") => r.writable(),
            Some("executable") => r.executable(),
            _ => true,
        })
        .map(region_json)
        .collect();
    Ok(Value::Array(regions))
}

fn handle_memory_validate(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let address = param_address(params, "address")?;
    let size = param_opt_usize(params, "size")?.unwrap_or(1);

    let mut result = json!({
        "valid": engine.memory.is_valid(address, size),
        "readable": engine.memory.is_readable(address, size),
        "writable": engine.memory.is_writable(address, size),
    });
    if let Some(region) = engine.memory.region_at(address) {
        result["region"] = region_json(&region);
    }
    Ok(result)
}

fn handle_memory_read(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let address = param_address(params, "address")?;
    let size = param_usize(params, "size")?;
    let type_str = param_opt_str(params, "type").unwrap_or("bytes");

    match type_str {
        "bytes" => {
            let bytes = engine
                .memory
                .read_bytes(address, size)
                .ok_or(Error::MemoryAccess {
                    address,
                    message: "read failed".to_string(),
                })?;
            Ok(Value::Array(
                bytes.iter().map(|b| json!(*b as u64)).collect(),
            ))
        }
        "string" => {
            let bytes = engine
                .memory
                .read_bytes(address, size.min(MAX_STRING_READ))
                .ok_or(Error::MemoryAccess {
                    address,
                    message: "read failed".to_string(),
                })?;
            Ok(json!(null_terminated(&bytes)))
        }
        _ => read_typed(engine, address, type_str),
    }
}

fn handle_memory_read_value(
    engine: &Engine,
    _ctx: &RequestContext,
    params: &Value,
) -> Result<Value> {
    let address = param_address(params, "address")?;
    let type_str = param_str(params, "type")?;

    match type_str {
        "string" => {
            let bytes = engine
                .memory
                .read_bytes(address, MAX_STRING_READ)
                .or_else(|| {
                    // Shorter window when the page ends before the cap
                    engine
                        .memory
                        .region_at(address)
                        .filter(|r| r.readable())
                        .and_then(|r| engine.memory.read_bytes(address, r.end() - address))
                })
                .ok_or(Error::MemoryAccess {
                    address,
                    message: "read failed".to_string(),
                })?;
            Ok(json!(null_terminated(&bytes)))
        }
        "bytes" => {
            let bytes = engine
                .memory
                .read_bytes(address, 16)
                .ok_or(Error::MemoryAccess {
                    address,
                    message: "read failed".to_string(),
                })?;
            Ok(json!(bytes_to_hex(&bytes)))
        }
        _ => read_typed(engine, address, type_str),
    }
}

/// Fixed-width typed read shared by `memory.read` and `memory.read_value`.
fn read_typed(engine: &Engine, address: usize, type_str: &str) -> Result<Value> {
    let fail = || Error::MemoryAccess {
        address,
        message: format!("failed to read {} value", type_str),
    };
    match type_str {
        "int" | "int32" => engine
            .memory
            .read::<i32>(address)
            .map(|v| json!(v))
            .ok_or_else(fail),
        // 64-bit values travel as strings so no precision is lost in transit
        "int64" => engine
            .memory
            .read::<i64>(address)
            .map(|v| json!(v.to_string()))
            .ok_or_else(fail),
        "float" => engine
            .memory
            .read::<f32>(address)
            .map(|v| json!(v))
            .ok_or_else(fail),
        "double" => engine
            .memory
            .read::<f64>(address)
            .map(|v| json!(v))
            .ok_or_else(fail),
        "byte" => engine
            .memory
            .read::<u8>(address)
            .map(|v| json!(v))
            .ok_or_else(fail),
        other => Err(Error::InvalidParameter(format!("Unknown type: {}", other))),
    }
}

fn null_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

fn handle_memory_write(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let address = param_address(params, "address")?;
    let value = param_value_string(params, "value").ok_or_else(|| missing("value"))?;
    let value_type = param_value_type(params, "type")?;

    let bytes = value_to_bytes(&value, value_type)?;
    if bytes.is_empty() {
        return Err(Error::InvalidParameter("Nothing to write".to_string()));
    }
    if !engine.memory.write_bytes(address, &bytes) {
        return Err(Error::MemoryAccess {
            address,
            message: "write failed".to_string(),
        });
    }
    Ok(json!({}))
}

fn handle_memory_scan(engine: &Engine, ctx: &RequestContext, params: &Value) -> Result<Value> {
    let value_type = param_value_type(params, "valueType")?;
    let scan_kind: ScanKind = param_opt_str(params, "scanType")
        .unwrap_or("exact")
        .parse()
        .map_err(Error::InvalidParameter)?;
    let first = param_opt_bool(params, "firstScan").unwrap_or(true);

    let fast_scan = param_opt_bool(params, "fastScan").unwrap_or(false);
    let options = ScanOptions {
        start_address: param_opt_address(params, "startAddress")?,
        end_address: param_opt_address(params, "endAddress")?,
        alignment: match param_opt_usize(params, "alignment")? {
            Some(a) if a > 0 => a,
            // Fast scan means stride 4 for the 4-byte types
            _ if fast_scan && value_type.width() == Some(4) => 4,
            _ => 1,
        },
        filter_writable: param_tri(params, "writable"),
        filter_executable: param_tri(params, "executable"),
        filter_copy_on_write: param_tri(params, "copyOnWrite"),
    };

    let value = param_value_string(params, "value");

    let results = if first {
        match scan_kind {
            ScanKind::Unknown => {
                scanner::first_scan(&engine.memory, scan_kind, &[], value_type, &options)
            }
            ScanKind::Exact | ScanKind::Fuzzy => {
                let value = value.ok_or_else(|| missing("value"))?;
                let needle = value_to_bytes(&value, value_type)?;
                scanner::first_scan(&engine.memory, scan_kind, &needle, value_type, &options)
            }
            _ => {
                return Err(Error::InvalidParameter(
                    "Scan type requires previous results".to_string(),
                ))
            }
        }
    } else {
        let entries = params
            .get("previousResults")
            .and_then(Value::as_array)
            .ok_or_else(|| missing("previousResults"))?;

        let mut previous = Vec::with_capacity(entries.len());
        for entry in entries {
            let address = param_address(entry, "address")?;
            let value = param_value_string(entry, "value").ok_or_else(|| missing("value"))?;
            previous.push(ScanResult {
                address,
                value: value_to_bytes(&value, value_type)?,
                previous_value: None,
                value_type,
            });
        }

        let needle = value
            .map(|v| value_to_bytes(&v, value_type))
            .transpose()?;
        scanner::next_scan(&engine.memory, scan_kind, needle.as_deref(), &previous)
    };

    let data: Vec<Value> = results
        .iter()
        .map(|r| {
            let mut entry = json!({
                "address": format_address(r.address),
                "value": bytes_to_string(&r.value, r.value_type),
            });
            if let Some(prev) = &r.previous_value {
                entry["previousValue"] = json!(bytes_to_string(prev, r.value_type));
            }
            if let Some(module) = engine.modules.display_for_address(r.address) {
                entry["module"] = json!(module);
            }
            entry
        })
        .collect();

    // Streaming consumers get the same results as an unsolicited frame
    if let Some(tx) = ctx.broadcast {
        let note = json!({
            "type": "scan_results",
            "count": data.len(),
            "data": data.clone(),
        });
        let _ = tx.send(note.to_string());
    }

    Ok(Value::Array(data))
}

fn handle_memory_disassemble(
    engine: &Engine,
    _ctx: &RequestContext,
    params: &Value,
) -> Result<Value> {
    let address = param_address(params, "address")?;
    let size = param_usize(params, "size")?;

    let bytes = engine
        .memory
        .read_bytes(address, size)
        .ok_or(Error::MemoryAccess {
            address,
            message: "read failed".to_string(),
        })?;

    let listing: Vec<Value> = disasm::disassemble_native(address, &bytes)
        .iter()
        .map(|insn| {
            let mut entry = json!({
                "address": format_address(insn.address),
                "bytes": bytes_to_hex(&insn.bytes),
                "mnemonic": insn.mnemonic,
                "operands": insn.operands,
                "length": insn.length,
                "isJump": insn.is_jump,
                "isCall": insn.is_call,
                "isRet": insn.is_ret,
            });
            if let Some(target) = insn.target {
                entry["target"] = json!(format_address(target));
            }
            entry
        })
        .collect();

    Ok(Value::Array(listing))
}

fn handle_memory_patch(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let address = param_address(params, "address")?;
    let original = hex_to_bytes(param_str(params, "original")?)?;
    let new = hex_to_bytes(param_str(params, "new")?)?;
    if original.is_empty() || new.is_empty() {
        return Err(Error::InvalidParameter("Empty patch".to_string()));
    }

    let current = engine
        .memory
        .read_bytes(address, original.len())
        .ok_or(Error::MemoryAccess {
            address,
            message: "read failed".to_string(),
        })?;
    if current != original {
        return Err(Error::MemoryAccess {
            address,
            message: "current bytes do not match the stated original".to_string(),
        });
    }

    if !engine.memory.write_bytes(address, &new) {
        return Err(Error::MemoryAccess {
            address,
            message: "patch write failed".to_string(),
        });
    }
    Ok(json!({}))
}

fn handle_memory_nop(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let address = param_address(params, "address")?;
    let size = param_usize(params, "size")?;
    if size == 0 {
        return Err(Error::InvalidParameter("Nothing to patch".to_string()));
    }

    if !engine.memory.write_bytes(address, &vec![0x90; size]) {
        return Err(Error::MemoryAccess {
            address,
            message: "nop write failed".to_string(),
        });
    }
    Ok(json!({}))
}

fn handle_memory_allocate(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let size = param_usize(params, "size")?;
    let protection = match params.get("protection") {
        Some(Value::String(s)) => Protection::from_windows(
            u32::from_str_radix(s.trim_start_matches("0x"), 16)
                .map_err(|_| Error::InvalidParameter(format!("Bad protection: {}", s)))?,
        ),
        Some(Value::Number(n)) => Protection::from_windows(n.as_u64().unwrap_or(0) as u32),
        _ => Protection::rwx(),
    };

    let address = engine
        .memory
        .allocate(size, protection)
        .ok_or_else(|| Error::Internal("allocation failed".to_string()))?;
    Ok(json!(format_address(address)))
}

fn handle_memory_free(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let address = param_address(params, "address")?;
    if !engine.memory.free(address) {
        return Err(Error::MemoryAccess {
            address,
            message: "free failed".to_string(),
        });
    }
    Ok(json!({}))
}

fn handle_memory_watch(engine: &Engine, ctx: &RequestContext, params: &Value) -> Result<Value> {
    let address = param_address(params, "address")?;
    let value_type = param_value_type(params, "type")?;
    if !engine.memory.is_readable(address, value_type.width().unwrap_or(1)) {
        return Err(Error::InvalidAddress(address));
    }

    let session = ctx
        .session
        .ok_or_else(|| Error::Protocol("watch requires a connection".to_string()))?;
    session.watch(address, value_type);
    Ok(json!({}))
}

fn handle_memory_unwatch(_engine: &Engine, ctx: &RequestContext, params: &Value) -> Result<Value> {
    let address = param_address(params, "address")?;
    let session = ctx
        .session
        .ok_or_else(|| Error::Protocol("watch requires a connection".to_string()))?;
    Ok(json!({ "removed": session.unwatch(address) }))
}

/// Default pattern range is the main module, as the listing UI expects.
fn pattern_range(engine: &Engine, params: &Value) -> Result<(usize, usize)> {
    let (default_start, default_end) = match engine.modules.main_module() {
        Some(m) => (m.base, m.end()),
        None => (0, usize::MAX),
    };
    Ok((
        param_opt_address(params, "start")?.unwrap_or(default_start),
        param_opt_address(params, "end")?.unwrap_or(default_end),
    ))
}

fn handle_pattern_scan(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let parsed = pattern::Pattern::parse(param_str(params, "pattern")?)?;
    let (start, end) = pattern_range(engine, params)?;

    match pattern::scan_first(&engine.memory, &parsed, start, end) {
        Some(address) => Ok(json!(format_address(address))),
        None => Err(Error::Internal("Pattern not found".to_string())),
    }
}

fn handle_pattern_scan_all(
    engine: &Engine,
    _ctx: &RequestContext,
    params: &Value,
) -> Result<Value> {
    let parsed = pattern::Pattern::parse(param_str(params, "pattern")?)?;
    let (start, end) = pattern_range(engine, params)?;

    let matches = pattern::scan_all(&engine.memory, &parsed, start, end, RESULT_CAP);
    Ok(Value::Array(
        matches
            .iter()
            .map(|a| json!(format_address(*a)))
            .collect(),
    ))
}

fn handle_pointer_chain(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let base = param_address(params, "base")?;
    let offsets_json = params
        .get("offsets")
        .and_then(Value::as_array)
        .ok_or_else(|| missing("offsets"))?;

    let mut offsets = Vec::with_capacity(offsets_json.len());
    for entry in offsets_json {
        let offset = match entry {
            Value::Number(n) => n
                .as_u64()
                .map(|v| v as usize)
                .ok_or_else(|| Error::InvalidParameter("Bad offset".to_string()))?,
            Value::String(s) => parse_address(s)?,
            _ => return Err(Error::InvalidParameter("Bad offset".to_string())),
        };
        offsets.push(offset);
    }

    match pointer::follow_chain(&engine.memory, base, &offsets) {
        Some(address) => Ok(json!(format_address(address))),
        None => Err(Error::MemoryAccess {
            address: base,
            message: "pointer chain hit an unreadable address".to_string(),
        }),
    }
}

fn handle_pointer_find(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let target = param_address(params, "target")?;
    let start = param_opt_address(params, "start")?;
    let end = param_opt_address(params, "end")?;

    let pointers = pointer::find_pointers_to(&engine.memory, target, start, end, RESULT_CAP);
    Ok(Value::Array(
        pointers
            .iter()
            .map(|a| json!(format_address(*a)))
            .collect(),
    ))
}

fn handle_hook_install(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let name = param_str(params, "name")?;
    let target = param_address(params, "target")?;
    let detour = param_address(params, "detour")?;
    let kind: HookKind = param_opt_str(params, "type")
        .unwrap_or("auto")
        .parse()
        .map_err(Error::InvalidParameter)?;

    let info = engine.hooks.install(name, target, detour, kind)?;
    Ok(hook_json(&info))
}

fn handle_hook_remove(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    engine.hooks.remove(param_str(params, "name")?)?;
    Ok(json!({}))
}

fn handle_hook_toggle(engine: &Engine, _ctx: &RequestContext, params: &Value) -> Result<Value> {
    let active = engine.hooks.toggle(param_str(params, "name")?)?;
    Ok(json!({ "active": active }))
}

fn handle_hook_list(engine: &Engine, _ctx: &RequestContext, _params: &Value) -> Result<Value> {
    Ok(Value::Array(
        engine.hooks.list().iter().map(hook_json).collect(),
    ))
}

fn hook_json(info: &spyglass_common::HookInfo) -> Value {
    json!({
        "name": info.name,
        "target": format_address(info.target),
        "detour": format_address(info.detour),
        "original": format_address(info.trampoline),
        "active": info.active,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> CommandRouter {
        CommandRouter::new(Engine::new())
    }

    fn run(router: &CommandRouter, request: &str) -> Value {
        let ctx = RequestContext::detached();
        serde_json::from_str(&router.execute(request, &ctx)).unwrap()
    }

    fn expect_data(response: &Value) -> &Value {
        assert_eq!(
            response["success"],
            Value::Bool(true),
            "expected success: {}",
            response
        );
        &response["data"]
    }

    #[test]
    fn test_unknown_command() {
        let router = router();
        let response = run(&router, r#"{"command":"nope.nothing","id":"7"}"#);
        assert_eq!(response["success"], Value::Bool(false));
        assert_eq!(response["id"], json!("7"));
        assert_eq!(response["error"], json!("Unknown command: nope.nothing"));
    }

    #[test]
    fn test_missing_command_and_bad_json() {
        let router = router();
        let response = run(&router, r#"{"id":"9"}"#);
        assert_eq!(response["success"], Value::Bool(false));
        assert_eq!(response["id"], json!("9"));

        let response = run(&router, "this is not json");
        assert_eq!(response["success"], Value::Bool(false));
        assert!(response.get("id").is_none());
    }

    #[test]
    fn test_process_info_echoes_id() {
        let router = router();
        let response = run(&router, r#"{"command":"process.info","id":"abc"}"#);
        assert_eq!(response["id"], json!("abc"));
        let data = expect_data(&response);
        assert_eq!(data["pid"], json!(std::process::id()));
        assert!(data["addressWidth"] == json!(64) || data["addressWidth"] == json!(32));
        assert!(data["memoryMetrics"]["total"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_module_commands() {
        let router = router();
        let response = run(&router, r#"{"command":"module.list"}"#);
        let modules = expect_data(&response).as_array().unwrap().clone();
        assert!(!modules.is_empty());

        let name = modules[0]["name"].as_str().unwrap().to_string();
        let response = run(
            &router,
            &json!({"command": "module.info", "name": name}).to_string(),
        );
        let info = expect_data(&response);
        assert!(info["baseAddress"].as_str().unwrap().starts_with("0x"));
        assert!(info["size"].as_u64().unwrap() > 0);

        let base = info["baseAddress"].as_str().unwrap().to_string();
        let response = run(
            &router,
            &json!({"command": "module.from_address", "address": base}).to_string(),
        );
        let hit = expect_data(&response);
        assert_eq!(hit["offset"], json!("0x0"));
        assert!(hit["displayName"].as_str().unwrap().contains("+0x0"));
    }

    #[test]
    fn test_allocate_write_read_free_cycle() {
        let router = router();

        let response = run(&router, r#"{"command":"memory.allocate","size":4096}"#);
        let address = expect_data(&response).as_str().unwrap().to_string();

        let request = json!({
            "command": "memory.write",
            "address": address,
            "value": "1094861636",
            "type": "int32",
        });
        expect_data(&run(&router, &request.to_string()));

        let request = json!({
            "command": "memory.read",
            "address": address,
            "size": 4,
            "type": "int",
        });
        let response = run(&router, &request.to_string());
        assert_eq!(expect_data(&response), &json!(1094861636));

        let request = json!({
            "command": "memory.read",
            "address": address,
            "size": 4,
        });
        let response = run(&router, &request.to_string());
        let bytes = expect_data(&response).as_array().unwrap();
        assert_eq!(bytes.len(), 4);

        let request = json!({
            "command": "memory.read_value",
            "address": address,
            "type": "bytes",
        });
        let response = run(&router, &request.to_string());
        let hex = expect_data(&response).as_str().unwrap();
        assert_eq!(hex.split(' ').count(), 16);

        let request = json!({"command": "memory.free", "address": address});
        expect_data(&run(&router, &request.to_string()));
    }

    #[test]
    fn test_validate_reports_flags() {
        let router = router();
        let response = run(&router, r#"{"command":"memory.allocate","size":4096}"#);
        let address = expect_data(&response).as_str().unwrap().to_string();

        let request = json!({"command": "memory.validate", "address": address, "size": 16});
        let data = run(&router, &request.to_string());
        let data = expect_data(&data);
        assert_eq!(data["valid"], json!(true));
        assert_eq!(data["readable"], json!(true));
        assert_eq!(data["writable"], json!(true));
        assert!(data["region"]["size"].as_u64().unwrap() >= 4096);

        let response = run(
            &router,
            r#"{"command":"memory.validate","address":"0x10"}"#,
        );
        let data = expect_data(&response);
        assert_eq!(data["valid"], json!(false));
    }

    #[test]
    fn test_scan_first_and_next() {
        let router = router();
        let response = run(&router, r#"{"command":"memory.allocate","size":4096}"#);
        let base_str = expect_data(&response).as_str().unwrap().to_string();
        let base = parse_address(&base_str).unwrap();
        let slot = format_address(base + 0x100);

        // Plant 100 at base+0x100
        let request = json!({
            "command": "memory.write", "address": slot, "value": 100, "type": "int32"
        });
        expect_data(&run(&router, &request.to_string()));

        // First scan over just our page
        let request = json!({
            "command": "memory.scan",
            "value": "100",
            "valueType": "int32",
            "scanType": "exact",
            "firstScan": true,
            "startAddress": base_str,
            "endAddress": format_address(base + 4096),
            "alignment": 4,
        });
        let response = run(&router, &request.to_string());
        let results = expect_data(&response).as_array().unwrap().clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["address"], json!(slot));
        assert_eq!(results[0]["value"], json!("100"));

        // Mutate and refine by "decreased"
        let request = json!({
            "command": "memory.write", "address": slot, "value": 99, "type": "int32"
        });
        expect_data(&run(&router, &request.to_string()));

        let request = json!({
            "command": "memory.scan",
            "valueType": "int32",
            "scanType": "decreased",
            "firstScan": false,
            "previousResults": [{"address": slot, "value": "100"}],
        });
        let response = run(&router, &request.to_string());
        let results = expect_data(&response).as_array().unwrap().clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["value"], json!("99"));
        assert_eq!(results[0]["previousValue"], json!("100"));

        let request = json!({"command": "memory.free", "address": base_str});
        expect_data(&run(&router, &request.to_string()));
    }

    #[test]
    fn test_scan_broadcasts_results() {
        let router = router();
        let response = run(&router, r#"{"command":"memory.allocate","size":4096}"#);
        let base_str = expect_data(&response).as_str().unwrap().to_string();
        let base = parse_address(&base_str).unwrap();

        let (tx, rx) = mpsc::channel();
        let ctx = RequestContext {
            session: None,
            broadcast: Some(&tx),
        };
        let request = json!({
            "command": "memory.scan",
            "value": "0",
            "valueType": "int32",
            "scanType": "exact",
            "firstScan": true,
            "startAddress": base_str,
            "endAddress": format_address(base + 64),
            "alignment": 4,
        });
        let raw = router.execute(&request.to_string(), &ctx);
        let response: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(response["success"], json!(true));

        let note: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(note["type"], json!("scan_results"));
        assert!(note.get("id").is_none());
        assert_eq!(
            note["count"].as_u64().unwrap() as usize,
            note["data"].as_array().unwrap().len()
        );
    }

    #[test]
    fn test_patch_refuses_mismatch_then_applies() {
        let router = router();
        let response = run(&router, r#"{"command":"memory.allocate","size":4096}"#);
        let address = expect_data(&response).as_str().unwrap().to_string();

        // Fresh pages are zeroed; claiming they hold NOPs must fail
        let request = json!({
            "command": "memory.patch",
            "address": address,
            "original": "90 90 90 90",
            "new": "CC CC CC CC",
        });
        let response = run(&router, &request.to_string());
        assert_eq!(response["success"], json!(false));

        let request = json!({
            "command": "memory.patch",
            "address": address,
            "original": "00 00 00 00",
            "new": "CC CC CC CC",
        });
        expect_data(&run(&router, &request.to_string()));

        let request = json!({
            "command": "memory.read", "address": address, "size": 4
        });
        let response = run(&router, &request.to_string());
        assert_eq!(
            expect_data(&response),
            &json!([0xCC, 0xCC, 0xCC, 0xCC])
        );

        // And back
        let request = json!({
            "command": "memory.patch",
            "address": address,
            "original": "CC CC CC CC",
            "new": "00 00 00 00",
        });
        expect_data(&run(&router, &request.to_string()));
    }

    #[test]
    fn test_nop_command() {
        let router = router();
        let response = run(&router, r#"{"command":"memory.allocate","size":4096}"#);
        let address = expect_data(&response).as_str().unwrap().to_string();

        let request = json!({"command": "memory.nop", "address": address, "size": 3});
        expect_data(&run(&router, &request.to_string()));

        let request = json!({"command": "memory.read", "address": address, "size": 4});
        let response = run(&router, &request.to_string());
        assert_eq!(expect_data(&response), &json!([0x90, 0x90, 0x90, 0x00]));
    }

    #[test]
    fn test_disassemble_command() {
        let router = router();
        let response = run(&router, r#"{"command":"memory.allocate","size":4096}"#);
        let address = expect_data(&response).as_str().unwrap().to_string();

        // nop; ret
        let request = json!({
            "command": "memory.patch",
            "address": address,
            "original": "00 00",
            "new": "90 C3",
        });
        expect_data(&run(&router, &request.to_string()));

        let request = json!({"command": "memory.disassemble", "address": address, "size": 2});
        let response = run(&router, &request.to_string());
        let listing = expect_data(&response).as_array().unwrap().clone();
        assert_eq!(listing[0]["mnemonic"], json!("nop"));
        assert_eq!(listing[1]["mnemonic"], json!("ret"));
        assert_eq!(listing[1]["isRet"], json!(true));
    }

    #[test]
    fn test_pattern_commands() {
        let router = router();
        let response = run(&router, r#"{"command":"memory.allocate","size":4096}"#);
        let base_str = expect_data(&response).as_str().unwrap().to_string();
        let base = parse_address(&base_str).unwrap();

        let request = json!({
            "command": "memory.patch",
            "address": format_address(base + 0x20),
            "original": "00 00 00 00",
            "new": "DE AD BE EF",
        });
        expect_data(&run(&router, &request.to_string()));

        let request = json!({
            "command": "pattern.scan",
            "pattern": "DE AD ?? EF",
            "start": base_str,
            "end": format_address(base + 4096),
        });
        let response = run(&router, &request.to_string());
        assert_eq!(expect_data(&response), &json!(format_address(base + 0x20)));

        let request = json!({
            "command": "pattern.scanall",
            "pattern": "DE AD BE EF",
            "start": base_str,
            "end": format_address(base + 4096),
        });
        let response = run(&router, &request.to_string());
        let all = expect_data(&response).as_array().unwrap().clone();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_pointer_commands() {
        let router = router();
        let response = run(&router, r#"{"command":"memory.allocate","size":4096}"#);
        let base_str = expect_data(&response).as_str().unwrap().to_string();
        let base = parse_address(&base_str).unwrap();

        // Store a pointer to base+0x200 at base
        router.engine().memory.write::<usize>(base, base + 0x200);

        let request = json!({
            "command": "pointer.chain",
            "base": base_str,
            "offsets": ["0x8"],
        });
        let response = run(&router, &request.to_string());
        assert_eq!(
            expect_data(&response),
            &json!(format_address(base + 0x208))
        );

        let request = json!({
            "command": "pointer.find",
            "target": format_address(base + 0x200),
            "start": base_str,
            "end": format_address(base + 4096),
        });
        let response = run(&router, &request.to_string());
        let found = expect_data(&response).as_array().unwrap().clone();
        assert_eq!(found, vec![json!(base_str)]);
    }

    #[test]
    fn test_hook_commands() {
        let router = router();
        let engine = Arc::clone(router.engine());

        // mov eax, 42; ret / mov eax, 7; ret
        let target = engine.memory.allocate(64, Protection::rwx()).unwrap();
        engine
            .memory
            .write_bytes(target, &[0xB8, 0x2A, 0, 0, 0, 0xC3]);
        let detour = engine.memory.allocate(64, Protection::rwx()).unwrap();
        engine
            .memory
            .write_bytes(detour, &[0xB8, 0x07, 0, 0, 0, 0xC3]);

        let request = json!({
            "command": "hook.install",
            "name": "test-hook",
            "target": format_address(target),
            "detour": format_address(detour),
            "type": "auto",
        });
        let response = run(&router, &request.to_string());
        let info = expect_data(&response);
        assert_eq!(info["name"], json!("test-hook"));
        assert_eq!(info["active"], json!(true));

        let response = run(&router, r#"{"command":"hook.list"}"#);
        assert_eq!(expect_data(&response).as_array().unwrap().len(), 1);

        let request = json!({"command": "hook.toggle", "name": "test-hook"});
        let response = run(&router, &request.to_string());
        assert_eq!(expect_data(&response)["active"], json!(false));

        let request = json!({"command": "hook.remove", "name": "test-hook"});
        expect_data(&run(&router, &request.to_string()));

        let response = run(&router, r#"{"command":"hook.list"}"#);
        assert!(expect_data(&response).as_array().unwrap().is_empty());

        engine.memory.free(target);
        engine.memory.free(detour);
    }

    #[test]
    fn test_watch_requires_connection() {
        let router = router();
        let response = run(&router, r#"{"command":"memory.allocate","size":4096}"#);
        let address = expect_data(&response).as_str().unwrap().to_string();

        let request = json!({"command": "memory.watch", "address": address, "type": "int32"});
        let response = run(&router, &request.to_string());
        assert_eq!(response["success"], json!(false));
        assert!(response["error"]
            .as_str()
            .unwrap()
            .contains("requires a connection"));
    }

    #[test]
    fn test_numeric_params_accept_numbers_and_strings() {
        let router = router();
        let response = run(&router, r#"{"command":"memory.allocate","size":"4096"}"#);
        let address = expect_data(&response).as_str().unwrap().to_string();
        let numeric = parse_address(&address).unwrap();

        // Address as JSON number
        let request = json!({
            "command": "memory.validate",
            "address": numeric,
        });
        let response = run(&router, &request.to_string());
        assert_eq!(expect_data(&response)["valid"], json!(true));
    }
}

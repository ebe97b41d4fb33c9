//! Names the peer resolves lazily through server queries.
//!
//! Events carry 64-bit ids instead of strings. A string id is the address of
//! a `&'static str`, a source location id is the address of its static
//! [`SourceLocationData`]. The peer asks for the text the first time it sees
//! an id.

use parking_lot::{Mutex, RwLock};
use protocol::event::{ParameterSetup, SourceLocation};
use std::collections::HashMap;
use std::sync::Arc;

/// Where a zone, lock or GPU zone was declared.
#[derive(Debug)]
pub struct SourceLocationData {
    pub name: Option<&'static str>,
    pub function: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub color: u32,
}

impl SourceLocationData {
    pub fn id(&'static self) -> u64 {
        self as *const SourceLocationData as u64
    }
}

/// Declares a static [`SourceLocationData`] for the current line.
///
/// ```
/// let loc = agent::source_location!("upload");
/// assert_eq!(loc.name, Some("upload"));
/// assert_eq!(loc.file, file!());
/// ```
#[macro_export]
macro_rules! source_location {
    ($name:expr) => {
        $crate::source_location!($name, 0)
    };
    ($name:expr, $color:expr) => {{
        static LOCATION: $crate::SourceLocationData = $crate::SourceLocationData {
            name: Some($name),
            function: module_path!(),
            file: file!(),
            line: line!(),
            color: $color,
        };
        &LOCATION
    }};
}

pub fn string_id(s: &'static str) -> u64 {
    s.as_ptr() as u64
}

struct Parameter {
    name: &'static str,
    is_bool: bool,
    value: i32,
}

pub type ParameterCallback = Arc<dyn Fn(u32, i32) + Send + Sync>;

#[derive(Default)]
pub(crate) struct NameRegistry {
    strings: RwLock<HashMap<u64, &'static str>>,
    locations: RwLock<HashMap<u64, &'static SourceLocationData>>,
    threads: RwLock<HashMap<u32, String>>,
    parameters: Mutex<HashMap<u32, Parameter>>,
    on_parameter: RwLock<Option<ParameterCallback>>,
}

impl NameRegistry {
    pub fn intern(&self, s: &'static str) -> u64 {
        let id = string_id(s);
        if !self.strings.read().contains_key(&id) {
            self.strings.write().entry(id).or_insert(s);
        }
        id
    }

    pub fn string(&self, id: u64) -> Option<&'static str> {
        self.strings.read().get(&id).copied()
    }

    pub fn location(&self, loc: &'static SourceLocationData) -> u64 {
        let id = loc.id();
        if self.locations.read().contains_key(&id) {
            return id;
        }
        if let Some(name) = loc.name {
            self.intern(name);
        }
        self.intern(loc.function);
        self.intern(loc.file);
        self.locations.write().insert(id, loc);
        id
    }

    pub fn source_location(&self, id: u64) -> Option<SourceLocation> {
        let loc = *self.locations.read().get(&id)?;
        Some(SourceLocation {
            ptr: id,
            name: loc.name.map(string_id).unwrap_or(0),
            function: string_id(loc.function),
            file: string_id(loc.file),
            line: loc.line,
            color: loc.color,
        })
    }

    pub fn set_thread_name(&self, thread: u32, name: &str) {
        self.threads.write().insert(thread, name.to_owned());
    }

    /// Registered name, else the kernel's comm for the thread.
    pub fn thread_name(&self, thread: u32) -> String {
        if let Some(name) = self.threads.read().get(&thread) {
            return name.clone();
        }
        std::fs::read_to_string(format!("/proc/self/task/{thread}/comm"))
            .map(|s| s.trim_end().to_owned())
            .unwrap_or_else(|_| "???".to_owned())
    }

    pub fn add_parameter(
        &self,
        idx: u32,
        name: &'static str,
        is_bool: bool,
        value: i32,
    ) -> ParameterSetup {
        let name_id = self.intern(name);
        self.parameters.lock().insert(
            idx,
            Parameter {
                name,
                is_bool,
                value,
            },
        );
        ParameterSetup {
            idx,
            name: name_id,
            is_bool,
            value,
        }
    }

    pub fn set_parameter_callback(&self, callback: ParameterCallback) {
        *self.on_parameter.write() = Some(callback);
    }

    /// Stores a value pushed by the peer and notifies the application.
    /// Unknown indices are ignored.
    pub fn update_parameter(&self, idx: u32, value: i32) -> bool {
        {
            let mut parameters = self.parameters.lock();
            let Some(parameter) = parameters.get_mut(&idx) else {
                return false;
            };
            parameter.value = if parameter.is_bool {
                (value != 0) as i32
            } else {
                value
            };
        }
        let callback = self.on_parameter.read().clone();
        if let Some(callback) = callback {
            callback(idx, value);
        }
        true
    }

    pub fn parameter(&self, idx: u32) -> Option<(&'static str, i32)> {
        self.parameters.lock().get(&idx).map(|p| (p.name, p.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[fixture]
    fn registry() -> NameRegistry {
        NameRegistry::default()
    }

    #[rstest]
    fn test_intern_is_idempotent(registry: NameRegistry) {
        let a = registry.intern("frame");
        let b = registry.intern("frame");
        assert_eq!(a, b);
        assert_eq!(registry.string(a), Some("frame"));
        assert_eq!(registry.string(a + 1), None);
    }

    #[rstest]
    fn test_location_registers_its_strings(registry: NameRegistry) {
        let loc = crate::source_location!("decode", 0xff00ff);
        let id = registry.location(loc);
        assert_eq!(id, loc.id());

        let srcloc = registry.source_location(id).unwrap();
        assert_eq!(srcloc.line, loc.line);
        assert_eq!(srcloc.color, 0xff00ff);
        assert_eq!(registry.string(srcloc.name), Some("decode"));
        assert_eq!(registry.string(srcloc.function), Some(module_path!()));
        assert_eq!(registry.string(srcloc.file), Some(file!()));
    }

    #[rstest]
    fn test_unnamed_location(registry: NameRegistry) {
        static LOC: SourceLocationData = SourceLocationData {
            name: None,
            function: "worker",
            file: "worker.rs",
            line: 7,
            color: 0,
        };
        let srcloc = registry
            .source_location(registry.location(&LOC))
            .unwrap();
        assert_eq!(srcloc.name, 0);
    }

    #[rstest]
    fn test_thread_name_falls_back_to_comm(registry: NameRegistry) {
        let tid = nix::unistd::gettid().as_raw() as u32;
        let comm = registry.thread_name(tid);
        assert!(!comm.is_empty());
        assert_ne!(comm, "???");

        registry.set_thread_name(tid, "io-worker");
        assert_eq!(registry.thread_name(tid), "io-worker");
        assert_eq!(registry.thread_name(u32::MAX), "???");
    }

    #[rstest]
    fn test_parameter_updates_notify(registry: NameRegistry) {
        let seen = Arc::new(AtomicI32::new(-1));
        let sink = seen.clone();
        registry.set_parameter_callback(Arc::new(move |_idx: u32, value: i32| {
            sink.store(value, Ordering::SeqCst)
        }));

        let setup = registry.add_parameter(3, "vsync", true, 1);
        assert!(setup.is_bool);
        assert_eq!(registry.string(setup.name), Some("vsync"));

        assert!(registry.update_parameter(3, 5));
        assert_eq!(registry.parameter(3), Some(("vsync", 1)));
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        assert!(!registry.update_parameter(9, 1));
    }
}

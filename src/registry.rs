//! Process-wide system table and the host API surface.
//!
//! Systems are created through the registry and retrieved by id; the
//! termination paths iterate the table in id order. Initialization is
//! one-shot and also installs the logger and the termination handlers.

use crate::error::{Error, Result};
use crate::system::{System, SystemId, DEFAULT_MSG_WRITE_SIZE_THRESHOLD};
use crate::util::validate_dir;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{error, info};

struct Registry {
    systems: BTreeMap<SystemId, Arc<System>>,
    initialized: bool,
    #[cfg(not(feature = "scrambled-ids"))]
    next_id: SystemId,
    #[cfg(feature = "scrambled-ids")]
    rng: rand::rngs::StdRng,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            systems: BTreeMap::new(),
            initialized: false,
            #[cfg(not(feature = "scrambled-ids"))]
            next_id: 0,
            #[cfg(feature = "scrambled-ids")]
            rng: {
                use rand::SeedableRng;
                rand::rngs::StdRng::from_entropy()
            },
        })
    })
}

#[cfg(not(feature = "scrambled-ids"))]
fn new_system_id(reg: &mut Registry) -> SystemId {
    let id = reg.next_id;
    reg.next_id += 1;
    id
}

#[cfg(feature = "scrambled-ids")]
fn new_system_id(reg: &mut Registry) -> SystemId {
    use rand::Rng;
    loop {
        let id: SystemId = reg.rng.gen_range(0..SystemId::MAX);
        if !reg.systems.contains_key(&id) {
            return id;
        }
    }
}

/// Initializes the engine: logger, signal handlers, exit hook. An empty
/// `log_dir` logs to stderr. `false` when already initialized or the log
/// directory is unusable.
pub fn initialize(log_dir: impl AsRef<Path>) -> bool {
    let log_dir = log_dir.as_ref();

    {
        let mut reg = registry().lock().unwrap();
        if reg.initialized {
            return false;
        }
        reg.initialized = true;
    }

    let logger_ok = if log_dir.as_os_str().is_empty() {
        crate::logger::init(None)
    } else {
        match validate_dir(log_dir) {
            Some(dir) => crate::logger::init(Some(&dir)),
            None => {
                eprintln!("invalid log dir {:?}", log_dir);
                false
            }
        }
    };

    crate::termination::install();
    info!("hostmeter initialized");
    logger_ok
}

/// Creates a system and returns its id. The output directory must name an
/// existing canonicalizable path.
pub fn create_system(
    output_dir: impl AsRef<Path>,
    default_sample_period: Duration,
    name: &str,
    msg_write_size_threshold: usize,
) -> Result<SystemId> {
    let output_dir = validate_dir(output_dir.as_ref()).ok_or_else(|| {
        error!(dir = ?output_dir.as_ref(), "output directory is not usable");
        Error::InvalidPath(
            output_dir.as_ref().to_path_buf(),
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a canonicalizable directory"),
        )
    })?;

    let mut reg = registry().lock().unwrap();
    let id = new_system_id(&mut reg);
    let system = Arc::new(System::new(
        id,
        name,
        output_dir,
        default_sample_period,
        msg_write_size_threshold,
    ));
    reg.systems.insert(id, system);
    Ok(id)
}

/// Creates a system with the default write threshold.
pub fn create_system_with_defaults(
    output_dir: impl AsRef<Path>,
    default_sample_period: Duration,
) -> Result<SystemId> {
    create_system(
        output_dir,
        default_sample_period,
        "",
        DEFAULT_MSG_WRITE_SIZE_THRESHOLD,
    )
}

/// Retrieves a system by id. The handle stays valid independent of the
/// registry entry.
pub fn system(id: SystemId) -> Option<Arc<System>> {
    registry().lock().unwrap().systems.get(&id).cloned()
}

/// Updates every meter of the system once and resets the buffers.
/// Convenience smoke test for host bindings.
pub fn test_run(id: SystemId) -> bool {
    match system(id) {
        Some(system) => {
            let ok = system.update_once();
            system.reset_all_buffers();
            ok
        }
        None => false,
    }
}

/// Halts every registered system in id order. Invoked from the
/// termination paths; safe to call at any time.
pub fn halt_all() {
    let systems: Vec<(SystemId, Arc<System>)> = {
        match registry().lock() {
            Ok(reg) => reg.systems.iter().map(|(k, v)| (*k, v.clone())).collect(),
            Err(_) => return,
        }
    };
    if systems.is_empty() {
        return;
    }
    info!(count = systems.len(), "halting all registered systems");
    for (id, system) in systems {
        info!(system = id, name = system.system_name(), "halting system");
        system.halt();
    }
    info!("all systems halted");
}

/// Normal-shutdown entry point for hosts that want an explicit teardown
/// instead of relying on the exit hook. Halts every system, then tears
/// the logger down.
pub fn shutdown() {
    halt_all();
    crate::logger::teardown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::cpu::cpu_meter;
    use crate::mock::MockFs;

    #[test]
    fn create_and_retrieve_system() {
        let dir = tempfile::tempdir().unwrap();
        let id = create_system(dir.path(), Duration::from_millis(500), "created", 1024).unwrap();
        let system = system(id).expect("system must be registered");
        assert_eq!(system.system_id(), id);
        assert_eq!(system.system_name(), "created");
        assert_eq!(system.msg_write_size_threshold(), 1024);

        // Ids are unique across systems.
        let other = create_system_with_defaults(dir.path(), Duration::from_millis(500)).unwrap();
        assert_ne!(id, other);
    }

    #[test]
    fn invalid_output_dir_is_rejected() {
        let result = create_system(
            "/nonexistent/path/12345",
            Duration::from_millis(500),
            "",
            DEFAULT_MSG_WRITE_SIZE_THRESHOLD,
        );
        assert!(matches!(result, Err(Error::InvalidPath(..))));
    }

    #[test]
    fn unknown_system_lookups_fail_softly() {
        assert!(system(SystemId::MAX).is_none());
        assert!(!test_run(SystemId::MAX));
    }

    #[test]
    fn registry_test_run_resets_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let id = create_system_with_defaults(dir.path(), Duration::from_millis(500)).unwrap();
        let sys = system(id).unwrap();
        sys.add_meter(cpu_meter(
            MockFs::typical_system(),
            "/proc",
            Duration::from_millis(500),
        ));

        assert!(test_run(id));
        // Buffers were cleared afterwards.
        let report = sys.report_status(false, false);
        assert!(report.contains("Msg wire size: 0 B"));
    }

    #[test]
    fn halt_all_with_registered_systems_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let id = create_system_with_defaults(dir.path(), Duration::from_millis(500)).unwrap();
        halt_all();
        assert!(system(id).is_some());
    }
}

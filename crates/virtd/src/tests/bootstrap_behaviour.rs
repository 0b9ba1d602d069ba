//! Behavioural tests for daemon bootstrap.

use std::sync::Arc;

use virtd_config::{ConfigError, HypervisorBackend};

use crate::bootstrap::{BootstrapError, SystemHypervisorFactory, bootstrap_with};
use crate::health::HealthReporter;

use super::support::{FailingConfigLoader, HealthEvent, RecordingHealthReporter, TestConfigLoader};

fn reporter() -> Arc<RecordingHealthReporter> {
    Arc::new(RecordingHealthReporter::default())
}

#[test]
fn bootstrap_prepares_the_socket_directory() {
    let loader = TestConfigLoader::new();
    let reporter = reporter();

    let daemon = bootstrap_with(
        &loader,
        Arc::clone(&reporter) as Arc<dyn HealthReporter>,
        &SystemHypervisorFactory,
    )
    .expect("bootstrap succeeds");

    assert_eq!(daemon.config().backend, HypervisorBackend::Memory);
    let parent = loader.socket_path().parent().expect("socket parent");
    assert!(parent.is_dir());
    assert_eq!(
        reporter.events(),
        vec![HealthEvent::BootstrapStarting, HealthEvent::BootstrapSucceeded]
    );
}

#[test]
fn configuration_failure_is_reported() {
    let reporter = reporter();

    let error = bootstrap_with(
        &FailingConfigLoader,
        Arc::clone(&reporter) as Arc<dyn HealthReporter>,
        &SystemHypervisorFactory,
    )
    .expect_err("bootstrap must fail");

    assert!(matches!(
        error,
        BootstrapError::Configuration {
            source: ConfigError::Load(_)
        }
    ));
    assert_eq!(
        reporter.events(),
        vec![
            HealthEvent::BootstrapStarting,
            HealthEvent::BootstrapFailed(error.to_string()),
        ]
    );
}

#[cfg(not(feature = "libvirt"))]
#[test]
fn missing_libvirt_binding_fails_bootstrap() {
    use virtd_config::Config;

    use crate::bootstrap::StaticConfigLoader;

    let loader = TestConfigLoader::new();
    let config = Config {
        backend: HypervisorBackend::Libvirt,
        ..loader.config()
    };
    let reporter = reporter();

    let error = bootstrap_with(
        &StaticConfigLoader::new(config),
        Arc::clone(&reporter) as Arc<dyn HealthReporter>,
        &SystemHypervisorFactory,
    )
    .expect_err("bootstrap must fail");

    assert!(matches!(error, BootstrapError::Hypervisor { .. }));
    assert!(matches!(
        reporter.events().last(),
        Some(HealthEvent::BootstrapFailed(_))
    ));
}

//! End-to-end matrix runs against a local source tree with `sh` builds.
#![cfg(unix)]

use async_trait::async_trait;
use kodegen_bundler_matrix::matrix::{
    Arch, ArgumentString, BuildCommand, CHECKSUM_MANIFEST, DEFAULT_ARGS_ENV, EmulationPolicy,
    EmulationRegistrar, LegError, LegStatus, MatrixOrchestrator, NoopRegistrar, Os, Platform,
    RunConfig, SourceSettings,
};
use kodegen_bundler_matrix::source::RepositorySource;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// `good*` legs write `wheelhouse/pkg-<args>.whl`, `bad` writes a wheel and then fails,
/// `empty` succeeds without producing anything.
const BUILD_SCRIPT: &str = r#"
set -e
mkdir -p wheelhouse
case "$MATRIX_PLATFORM" in
  bad)
    echo "wheel" > wheelhouse/bad.whl
    echo "compiler exploded" >&2
    exit 3
    ;;
  empty)
    echo "nothing to do"
    ;;
  slow)
    echo "compiling extension"
    sleep 30
    ;;
  *)
    printf '%s' "$BUILD_ARGS" > "wheelhouse/pkg-$MATRIX_PLATFORM.whl"
    printf 'sdist' > "wheelhouse/pkg-$MATRIX_PLATFORM.tar.gz"
    echo "built $MATRIX_PLATFORM"
    ;;
esac
"#;

struct Fixture {
    source: TempDir,
    output: TempDir,
    work: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("build.sh"), BUILD_SCRIPT).unwrap();
        std::fs::write(source.path().join("setup.py"), "").unwrap();
        Self {
            source,
            output: tempfile::tempdir().unwrap(),
            work: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self, platforms: Vec<Platform>, args: &str) -> RunConfig {
        RunConfig {
            platforms,
            args: ArgumentString::new(args),
            args_env: DEFAULT_ARGS_ENV.to_string(),
            command: BuildCommand::from_parts(&["sh".to_string(), "build.sh".to_string()]).unwrap(),
            source: SourceSettings {
                repository: RepositorySource::Local(self.source.path().to_path_buf()),
                git_ref: None,
                recursive: false,
            },
            patterns: vec!["wheelhouse/*.whl".to_string(), "wheelhouse/*.tar.gz".to_string()],
            output_dir: self.output.path().to_path_buf(),
            archive: false,
            emulation: EmulationPolicy {
                enabled: false,
                ..Default::default()
            },
            timeout: None,
            work_root: self.work.path().to_path_buf(),
            max_parallel: None,
            keep_workdirs: false,
        }
    }

    fn staged(&self, id: &str) -> Vec<String> {
        let dir = self.output.path().join(id);
        let mut names: Vec<String> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => return Vec::new(),
        };
        names.sort();
        names
    }
}

/// Host-runnable platform with a chosen architecture label.
fn host_platform(id: &str, arch: Arch) -> Platform {
    Platform::from_id(id).with_os(Os::host()).with_arch(arch)
}

fn ids(ids: &[&str]) -> Vec<Platform> {
    ids.iter().map(|id| host_platform(id, Arch::host())).collect()
}

#[derive(Default)]
struct CountingRegistrar {
    calls: Mutex<Vec<String>>,
    fail_for: Option<String>,
}

#[async_trait]
impl EmulationRegistrar for CountingRegistrar {
    async fn register(&self, platform: &Platform, _policy: &EmulationPolicy) -> Result<(), LegError> {
        self.calls.lock().unwrap().push(platform.id.clone());
        if self.fail_for.as_deref() == Some(platform.id.as_str()) {
            return Err(LegError::EmulationSetup {
                reason: "binfmt registration denied".to_string(),
            });
        }
        Ok(())
    }
}

#[tokio::test]
async fn failing_leg_does_not_affect_siblings() {
    let fixture = Fixture::new();
    let config = fixture.config(ids(&["good-a", "bad", "good-b"]), "--sdist 1");
    let report = MatrixOrchestrator::new(config, Arc::new(NoopRegistrar))
        .run()
        .await
        .unwrap();

    assert!(!report.succeeded);
    assert_eq!(report.exit_code(), 1);

    for id in ["good-a", "good-b"] {
        let leg = report.leg(id).unwrap();
        assert_eq!(leg.status, LegStatus::Succeeded);
        assert_eq!(leg.artifacts.len(), 2);
        assert!(leg.output.stdout.contains(&format!("built {}", id)));
        assert!(leg.work_dir.is_none());
        assert_eq!(
            fixture.staged(id),
            vec![
                CHECKSUM_MANIFEST.to_string(),
                format!("pkg-{}.tar.gz", id),
                format!("pkg-{}.whl", id)
            ]
        );
        // The argument string reaches the build unchanged
        let wheel = fixture.output.path().join(id).join(format!("pkg-{}.whl", id));
        assert_eq!(std::fs::read_to_string(wheel).unwrap(), "--sdist 1");
    }

    let bad = report.leg("bad").unwrap();
    assert_eq!(bad.status, LegStatus::Failed);
    assert_eq!(bad.failed_stage, Some(LegStatus::Building));
    assert_eq!(bad.error_kind.as_deref(), Some("build_command"));
    assert_eq!(bad.output.exit_code, Some(3));
    assert!(bad.output.stderr.contains("compiler exploded"));
    assert!(bad.artifacts.is_empty());
    // Matching files in a failed tree are never published
    assert!(fixture.staged("bad").is_empty());
    // Failed legs keep their tree for inspection
    let kept = bad.work_dir.as_ref().unwrap();
    assert!(kept.join("wheelhouse/bad.whl").is_file());
}

#[tokio::test]
async fn zero_matches_is_a_successful_empty_leg() {
    let fixture = Fixture::new();
    let config = fixture.config(ids(&["empty"]), "");
    let report = MatrixOrchestrator::new(config, Arc::new(NoopRegistrar))
        .run()
        .await
        .unwrap();

    assert!(report.succeeded);
    let leg = report.leg("empty").unwrap();
    assert!(leg.artifacts.is_empty());
    assert!(leg.bundle.is_none());
    assert!(!fixture.output.path().join("empty").exists());
    // No leg kept a tree, so the run directory is gone too
    assert_eq!(std::fs::read_dir(fixture.work.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn rerun_replaces_previous_staging() {
    let fixture = Fixture::new();
    let platforms = ids(&["good"]);

    let first = MatrixOrchestrator::new(fixture.config(platforms.clone(), "first"), Arc::new(NoopRegistrar))
        .run()
        .await
        .unwrap();
    assert!(first.succeeded);
    std::fs::write(fixture.output.path().join("good/stale.whl"), "old").unwrap();

    let second = MatrixOrchestrator::new(fixture.config(platforms, "second"), Arc::new(NoopRegistrar))
        .run()
        .await
        .unwrap();
    assert!(second.succeeded);
    assert_ne!(first.run_id, second.run_id);

    assert_eq!(
        fixture.staged("good"),
        vec!["SHA256SUMS", "pkg-good.tar.gz", "pkg-good.whl"]
    );
    let wheel = fixture.output.path().join("good/pkg-good.whl");
    assert_eq!(std::fs::read_to_string(wheel).unwrap(), "second");
    assert_eq!(
        first.leg("good").unwrap().artifacts.names().collect::<Vec<_>>(),
        second.leg("good").unwrap().artifacts.names().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn emulation_registers_only_for_the_gated_platform() {
    let fixture = Fixture::new();
    let foreign = if Arch::host() == Arch::Riscv64 {
        Arch::Armhf
    } else {
        Arch::Riscv64
    };
    let mut config = fixture.config(
        vec![
            host_platform("good-emulated", Arch::host()),
            host_platform("good-plain", foreign),
        ],
        "",
    );
    config.emulation = EmulationPolicy {
        enabled: true,
        os: Os::host(),
        arch: Arch::host(),
        ..Default::default()
    };

    let registrar = Arc::new(CountingRegistrar::default());
    let report = MatrixOrchestrator::new(config, registrar.clone())
        .run()
        .await
        .unwrap();

    assert!(report.succeeded);
    assert_eq!(*registrar.calls.lock().unwrap(), vec!["good-emulated".to_string()]);
    assert!(report.leg("good-emulated").unwrap().emulation_registered);
    assert!(!report.leg("good-plain").unwrap().emulation_registered);
}

#[tokio::test]
async fn emulation_failure_fails_only_its_leg() {
    let fixture = Fixture::new();
    let foreign = if Arch::host() == Arch::Riscv64 {
        Arch::Armhf
    } else {
        Arch::Riscv64
    };
    let mut config = fixture.config(
        vec![
            host_platform("good-emulated", Arch::host()),
            host_platform("good-plain", foreign),
        ],
        "",
    );
    config.emulation = EmulationPolicy {
        enabled: true,
        os: Os::host(),
        arch: Arch::host(),
        ..Default::default()
    };

    let registrar = Arc::new(CountingRegistrar {
        fail_for: Some("good-emulated".to_string()),
        ..Default::default()
    });
    let report = MatrixOrchestrator::new(config, registrar)
        .run()
        .await
        .unwrap();

    let emulated = report.leg("good-emulated").unwrap();
    assert_eq!(emulated.status, LegStatus::Failed);
    assert_eq!(emulated.failed_stage, Some(LegStatus::EmulationSetup));
    assert_eq!(emulated.error_kind.as_deref(), Some("emulation_setup"));
    assert!(fixture.staged("good-emulated").is_empty());

    assert!(report.leg("good-plain").unwrap().succeeded());
}

#[tokio::test]
async fn timeout_is_reported_per_leg() {
    let fixture = Fixture::new();
    let mut config = fixture.config(ids(&["slow", "good"]), "");
    config.timeout = Some(Duration::from_millis(500));

    let report = MatrixOrchestrator::new(config, Arc::new(NoopRegistrar))
        .run()
        .await
        .unwrap();

    let slow = report.leg("slow").unwrap();
    assert_eq!(slow.error_kind.as_deref(), Some("timeout"));
    assert_eq!(slow.failed_stage, Some(LegStatus::Building));
    assert_eq!(slow.error.as_deref(), Some("build command timed out after 500ms"));
    assert_eq!(slow.output.stdout, "compiling extension\n");
    assert!(report.leg("good").unwrap().succeeded());
}

#[tokio::test]
async fn bounded_parallelism_still_runs_every_leg() {
    let fixture = Fixture::new();
    let mut config = fixture.config(ids(&["good-1", "good-2", "good-3", "bad"]), "x");
    config.max_parallel = Some(1);
    config.archive = true;

    let report = MatrixOrchestrator::new(config, Arc::new(NoopRegistrar))
        .run()
        .await
        .unwrap();

    assert_eq!(report.legs.len(), 4);
    assert_eq!(report.failed_legs().count(), 1);
    for id in ["good-1", "good-2", "good-3"] {
        let bundle = report.leg(id).unwrap().bundle.clone().unwrap();
        assert_eq!(bundle, fixture.output.path().join(format!("{}.tar.gz", id)));
        assert!(bundle.is_file());
    }
    assert!(!fixture.output.path().join("bad.tar.gz").exists());
}

#[tokio::test]
async fn keep_workdirs_retains_successful_trees() {
    let fixture = Fixture::new();
    let mut config = fixture.config(ids(&["good"]), "");
    config.keep_workdirs = true;

    let report = MatrixOrchestrator::new(config, Arc::new(NoopRegistrar))
        .run()
        .await
        .unwrap();

    let work_dir = report.leg("good").unwrap().work_dir.clone().unwrap();
    assert!(work_dir.join("setup.py").is_file());
    assert!(work_dir.starts_with(fixture.work.path()));
    assert!(Path::new(&work_dir).join("wheelhouse/pkg-good.whl").is_file());
}

#[tokio::test]
async fn missing_source_fails_at_provisioning() {
    let fixture = Fixture::new();
    let mut config = fixture.config(ids(&["good"]), "");
    config.source.repository = RepositorySource::Local(fixture.source.path().join("missing"));

    let report = MatrixOrchestrator::new(config, Arc::new(NoopRegistrar))
        .run()
        .await
        .unwrap();

    let leg = report.leg("good").unwrap();
    assert_eq!(leg.failed_stage, Some(LegStatus::Provisioning));
    assert_eq!(leg.error_kind.as_deref(), Some("acquisition"));
}

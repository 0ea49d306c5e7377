//! Drives the client against a shell script that mimics restic.
//!
//! Everything runs in one test so the script is written exactly once before
//! any process is spawned.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use pretty_assertions::assert_eq;

use glacier_restic::{
    BackupRequest, FailureKind, KeepPolicy, Repository, RepositoryStatus, Restic, ResticError,
};

const FAKE_RESTIC: &str = r#"#!/bin/sh
cmd="$1"
shift
case "$cmd" in
  version)
    echo "restic 0.17.3 compiled with go1.23.4 on linux/amd64"
    ;;
  snapshots)
    if [ -f "$RESTIC_REPOSITORY/config" ]; then
      echo "[]"
    else
      echo "Fatal: unable to open config file: stat $RESTIC_REPOSITORY/config: no such file or directory" >&2
      echo "Is there a repository at the following location?" >&2
      exit 10
    fi
    ;;
  init)
    mkdir -p "$RESTIC_REPOSITORY" && touch "$RESTIC_REPOSITORY/config"
    echo "created restic repository at $RESTIC_REPOSITORY"
    ;;
  backup)
    echo "$@" > "$RESTIC_REPOSITORY/backup_args"
    case "$1" in
      /full)
        echo "Fatal: unable to save snapshot: write $RESTIC_REPOSITORY/data: no space left on device" >&2
        exit 1
        ;;
      /partial)
        echo '{"message_type":"error","error":{"message":"permission denied"},"during":"archival","item":"/partial/secret"}'
        echo '{"message_type":"summary","files_new":1,"total_files_processed":1,"total_bytes_processed":10,"snapshot_id":"partial01"}'
        exit 3
        ;;
    esac
    echo "using parent snapshot 00000000"
    echo '{"message_type":"status","percent_done":0.5,"total_files":2,"files_done":1,"total_bytes":2048,"bytes_done":1024}'
    echo '{"message_type":"status","percent_done":1,"total_files":2,"files_done":2,"total_bytes":2048,"bytes_done":2048}'
    echo '{"message_type":"summary","files_new":2,"total_files_processed":2,"total_bytes_processed":2048,"snapshot_id":"abc123"}'
    ;;
  forget)
    echo "$@" > "$RESTIC_REPOSITORY/forget_args"
    ;;
  *)
    echo "unknown command $cmd" >&2
    exit 1
    ;;
esac
"#;

fn install_fake(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("restic");
    std::fs::write(&path, FAKE_RESTIC).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
async fn test_fake_restic_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let restic = Restic::locate(Some(install_fake(dir.path()).as_path())).unwrap();
    let repo_path = dir.path().join("repo");
    let repo = Repository::new(repo_path.to_string_lossy(), "secret");

    assert_eq!(
        restic.version().await.unwrap(),
        "restic 0.17.3 compiled with go1.23.4 on linux/amd64"
    );

    // A missing repository is initialized once.
    assert_eq!(
        restic.ensure_repository(&repo).await.unwrap(),
        RepositoryStatus::Initialized
    );
    assert_eq!(
        restic.ensure_repository(&repo).await.unwrap(),
        RepositoryStatus::Existing
    );

    // Progress is streamed and the summary captured.
    let excludes = vec!["*.tmp".to_string(), "cache/".to_string()];
    let mut progress = Vec::new();
    let report = restic
        .backup(
            &repo,
            &BackupRequest {
                source: "/data",
                excludes: &excludes,
                compression: Some("max".to_string()),
            },
            |status| progress.push(status.percent_done),
        )
        .await
        .unwrap();

    assert_eq!(progress, vec![0.5, 1.0]);
    let summary = report.summary.unwrap();
    assert_eq!(summary.total_files_processed, 2);
    assert_eq!(summary.snapshot_id.as_deref(), Some("abc123"));
    assert!(!report.incomplete);
    assert_eq!(
        std::fs::read_to_string(repo_path.join("backup_args")).unwrap(),
        "/data --json --exclude *.tmp --exclude cache/ --compression max\n"
    );

    // Exit code 3 with a summary is a warning, not a failure.
    let report = restic
        .backup(
            &repo,
            &BackupRequest {
                source: "/partial",
                ..Default::default()
            },
            |_| {},
        )
        .await
        .unwrap();
    assert!(report.incomplete);
    assert_eq!(report.file_errors, vec!["/partial/secret: permission denied"]);

    // A full destination is classified.
    let err = restic
        .backup(
            &repo,
            &BackupRequest {
                source: "/full",
                ..Default::default()
            },
            |_| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ResticError::CommandFailed { exit_code: Some(1), .. }));
    assert_eq!(err.failure_kind(), FailureKind::NoSpace);

    // Only positive keep rules reach forget.
    restic
        .forget(
            &repo,
            &KeepPolicy {
                daily: Some(7),
                weekly: Some(0),
                yearly: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(repo_path.join("forget_args")).unwrap(),
        "--prune --keep-daily 7 --keep-yearly 1\n"
    );
}

/// End-to-end comparison tests over real directory trees.
///
/// These tests exercise `LocalGuest` (jwalk listing, host file reads) and the
/// full comparison pipeline against two temporary directories standing in
/// for mounted guest images.
use diffsleuth_core::adapter::local::LocalGuest;
use diffsleuth_core::content::sha256;
use diffsleuth_core::extract::{extract_files, EXTRACTED_DIR};
use diffsleuth_core::model::EntryKind;
use diffsleuth_core::{Comparator, CompareConfig, CompareError, ComparisonReport, ImageSources};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Create a reproducible guest tree:
///
/// ```text
/// root/
///   Windows/
///     System32/
///       cmd.exe     (100 bytes)
///   Users/
///     alice/
///       notes.txt   (200 bytes)
///   boot.ini        (50 bytes)
/// ```
fn build_test_tree(root: &Path) {
    let system32 = root.join("Windows").join("System32");
    let alice = root.join("Users").join("alice");
    fs::create_dir_all(&system32).unwrap();
    fs::create_dir_all(&alice).unwrap();

    write_bytes(&system32.join("cmd.exe"), 100, b'c');
    write_bytes(&alice.join("notes.txt"), 200, b'n');
    write_bytes(&root.join("boot.ini"), 50, b'b');
}

fn write_bytes(path: &Path, n: usize, fill: u8) {
    let mut f = fs::File::create(path).unwrap();
    f.write_all(&vec![fill; n]).unwrap();
}

fn local(root: &Path) -> ImageSources {
    ImageSources::new(Arc::new(LocalGuest::new(root).with_threads(2)))
}

fn compare(old: &Path, new: &Path) -> ComparisonReport {
    Comparator::new(CompareConfig::default())
        .expect("valid config")
        .compare(&local(old), &local(new))
        .expect("comparison succeeds")
        .report
}

/// Two copies of the test tree.
fn twin_trees() -> (TempDir, TempDir) {
    let old = TempDir::new().expect("failed to create temp dir");
    let new = TempDir::new().expect("failed to create temp dir");
    build_test_tree(old.path());
    build_test_tree(new.path());
    (old, new)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Two identical trees compare as unchanged.
#[test]
fn identical_directories_are_unchanged() {
    let (old, new) = twin_trees();
    let report = compare(old.path(), new.path());
    assert!(report.is_empty(), "{report:?}");
    assert!(!report.partial);
}

/// Created, deleted and modified files are all found, in path order.
#[test]
fn detects_every_change_class() {
    let (old, new) = twin_trees();
    write_bytes(&new.path().join("Windows/System32/cmd.exe"), 100, b'X');
    fs::remove_file(new.path().join("boot.ini")).unwrap();
    write_bytes(&new.path().join("Users/alice/payload.bin"), 10, b'p');

    let report = compare(old.path(), new.path());

    assert_eq!(report.created_files.len(), 1);
    assert_eq!(report.created_files[0].path, "/Users/alice/payload.bin");
    assert_eq!(report.created_files[0].digest, Some(sha256(&[b'p'; 10])));

    assert_eq!(report.deleted_files.len(), 1);
    assert_eq!(report.deleted_files[0].path, "/boot.ini");
    assert_eq!(report.deleted_files[0].size, 50);

    assert_eq!(report.modified_files.len(), 1);
    let modified = &report.modified_files[0];
    assert_eq!(modified.path, "/Windows/System32/cmd.exe");
    assert_eq!(modified.old_digest, Some(sha256(&[b'c'; 100])));
    assert_eq!(modified.new_digest, Some(sha256(&[b'X'; 100])));
}

/// A deleted directory produces one record per entry beneath it.
#[test]
fn deleted_directory_lists_its_contents() {
    let (old, new) = twin_trees();
    fs::remove_dir_all(new.path().join("Users")).unwrap();

    let report = compare(old.path(), new.path());
    let paths: Vec<&str> = report.deleted_files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["/Users", "/Users/alice", "/Users/alice/notes.txt"]);
    assert_eq!(report.deleted_files[0].kind, EntryKind::Directory);
}

/// Comparing from a sub-root only sees that subtree.
#[test]
fn root_option_limits_the_comparison() {
    let (old, new) = twin_trees();
    fs::remove_file(new.path().join("boot.ini")).unwrap();
    write_bytes(&new.path().join("Users/alice/new.txt"), 5, b'n');

    let config = CompareConfig {
        root: "/Users".into(),
        ..CompareConfig::default()
    };
    let report = Comparator::new(config)
        .unwrap()
        .compare(&local(old.path()), &local(new.path()))
        .unwrap()
        .report;

    assert!(report.deleted_files.is_empty());
    assert_eq!(report.created_files.len(), 1);
    assert_eq!(report.created_files[0].path, "/Users/alice/new.txt");
}

/// A root missing on the host is fatal.
#[test]
fn missing_root_directory_is_fatal() {
    let (old, new) = twin_trees();
    let config = CompareConfig {
        root: "/ProgramData".into(),
        ..CompareConfig::default()
    };
    let err = Comparator::new(config)
        .unwrap()
        .compare(&local(old.path()), &local(new.path()))
        .unwrap_err();
    assert!(matches!(err, CompareError::RootNotFound { .. }));
}

/// With `identify` set, created executables carry a type description.
#[test]
fn identify_adds_type_to_records() {
    let (old, new) = twin_trees();
    let mut pe = b"MZ".to_vec();
    pe.resize(256, 0);
    fs::write(new.path().join("Users/alice/dropper.exe"), &pe).unwrap();

    let config = CompareConfig {
        identify: true,
        ..CompareConfig::default()
    };
    let report = Comparator::new(config)
        .unwrap()
        .compare(&local(old.path()), &local(new.path()))
        .unwrap()
        .report;

    assert_eq!(report.created_files.len(), 1);
    assert_eq!(
        report.created_files[0].type_signature.as_deref(),
        Some("PE32 executable (MS Windows)")
    );
}

/// Created files can be extracted by digest after a comparison.
#[test]
fn created_files_can_be_extracted() {
    let (old, new) = twin_trees();
    write_bytes(&new.path().join("Users/alice/payload.bin"), 64, b'p');
    let report = compare(old.path(), new.path());
    let out = TempDir::new().unwrap();

    let guest = LocalGuest::new(new.path());
    let files: Vec<_> = report
        .created_files
        .iter()
        .filter_map(|f| f.digest.as_ref().map(|d| (f.path.as_str(), d)))
        .collect();
    let extracted = extract_files(&guest, files, out.path()).unwrap();

    let digest = sha256(&[b'p'; 64]).to_hex();
    let target = out.path().join(EXTRACTED_DIR).join(&digest);
    assert_eq!(extracted.extracted.get(&digest), Some(&target));
    assert_eq!(fs::read(target).unwrap(), vec![b'p'; 64]);
}

/// Symlinks are recorded with their target and never followed.
#[cfg(unix)]
#[test]
fn symlink_target_change_is_modified() {
    let (old, new) = twin_trees();
    std::os::unix::fs::symlink("/boot.ini", old.path().join("link")).unwrap();
    std::os::unix::fs::symlink("/Users", new.path().join("link")).unwrap();

    let report = compare(old.path(), new.path());
    assert_eq!(report.modified_files.len(), 1);
    assert_eq!(report.modified_files[0].path, "/link");
    assert_eq!(report.modified_files[0].old_kind, EntryKind::Symlink);
    assert!(report.created_files.is_empty());
}

/// Names that are not valid UTF-8 get distinct guest paths and stay readable.
#[cfg(unix)]
#[test]
fn non_utf8_siblings_are_distinct_and_readable() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let (old, new) = twin_trees();
    for root in [old.path(), new.path()] {
        write_bytes(&root.join(OsStr::from_bytes(b"a\xff")), 8, b'f');
        write_bytes(&root.join(OsStr::from_bytes(b"a\xfe")), 8, b'e');
    }

    let report = compare(old.path(), new.path());
    assert!(report.is_empty(), "{report:?}");
    assert!(!report.partial);
    assert!(report.diagnostics.is_empty());

    write_bytes(&new.path().join(OsStr::from_bytes(b"a\xfe")), 8, b'E');
    let report = compare(old.path(), new.path());
    assert_eq!(report.modified_files.len(), 1);
    let modified = &report.modified_files[0];
    assert_eq!(modified.path, "/a\\xfe");
    assert!(!modified.unverifiable);
    assert_eq!(modified.new_digest, Some(sha256(&[b'E'; 8])));
}

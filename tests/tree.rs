use portos::{Dir, FieldValue, StatField};
use tempfile::TempDir;

#[test]
fn recursive_removal_of_a_wide_tree() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    std::fs::create_dir(&root).unwrap();
    for d in 0..10 {
        let sub = root.join(format!("dir{d:02}"));
        std::fs::create_dir(&sub).unwrap();
        for f in 0..100 {
            std::fs::write(sub.join(format!("file{f:03}")), b"payload").unwrap();
        }
    }

    portos::dir::remove_recursive(&root).unwrap();
    let err = portos::stat::stat(&root, &[]).unwrap_err();
    assert_eq!(err.name(), "ENOENT");
}

#[test]
fn make_then_remove_succeeds() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("fresh");
    portos::dir::make(&path, None).unwrap();
    portos::dir::remove(&path).unwrap();
    assert!(!path.exists());
}

#[test]
fn nested_make_recursive() {
    let tmp = TempDir::new().unwrap();
    let deep = tmp.path().join("a/b/c/d");
    portos::dir::make_recursive(&deep, None).unwrap();
    assert!(deep.is_dir());
    portos::dir::remove_recursive(&tmp.path().join("a")).unwrap();
    assert!(!tmp.path().join("a").exists());
}

#[test]
fn enumeration_matches_projection_order() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("data"), b"123456").unwrap();
    let dir = Dir::open(tmp.path()).unwrap();
    let fields = [StatField::Name, StatField::Size, StatField::Type];
    let entry = dir.read(&fields).unwrap().unwrap();
    assert_eq!(entry.len(), 3);
    assert_eq!(entry[0], FieldValue::Str("data".into()));
    assert_eq!(entry[1], FieldValue::Num(6.0));
    assert!(dir.read(&fields).unwrap().is_none());
}

#[test]
fn pipes_feed_processes() {
    // A pipe's write end handed to a child as stdout, read back here.
    let mut proc = portos::Proc::new("sh");
    proc.io_set(
        portos::IoMode::None,
        portos::IoMode::FullBlock,
        portos::IoMode::None,
    );
    proc.exec(&["-c", "printf 'from child'"]).unwrap();
    let out = proc.out_get().unwrap();
    assert_eq!(out.read_all().unwrap(), b"from child");
    let (why, code) = proc.wait(true).unwrap().unwrap();
    assert_eq!(why, portos::WaitWhy::Exit);
    assert_eq!(code, 0);
}

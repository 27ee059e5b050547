mod common;

use common::{hosts_path, init_hosts, HOSTS};
use heracles::{ErrorCode, Flags};

#[test]
fn save_new_file() {
    let (mut hera, root) = init_hosts(Flags::empty());

    assert_eq!(
        hera.count("/heracles/files/etc/hosts2/path").unwrap(),
        0
    );

    hera.transform("Hosts.lns", "/etc/hosts2", false)
        .expect("Failed to add transform");
    hera.set("/files/etc/hosts2/1/ipaddr", Some("10.0.0.1"))
        .expect("Failed to set");
    hera.set("/files/etc/hosts2/1/canonical", Some("new.example.com"))
        .expect("Failed to set");

    hera.save().expect("Failed to save");

    assert_eq!(
        hera.count("/heracles/files/etc/hosts2/path").unwrap(),
        1
    );
    assert_eq!(
        std::fs::read_to_string(root.path().join("etc").join("hosts2"))
            .unwrap(),
        "10.0.0.1 new.example.com\n"
    );
    assert_eq!(
        hera.matches("/heracles/events/saved").unwrap().len(),
        1
    );
    let (_, saved) = hera.get("/heracles/events/saved").unwrap();
    assert_eq!(saved.as_deref(), Some("/files/etc/hosts2"));
}

#[test]
fn save_nonexistent_lens() {
    let (mut hera, _root) = init_hosts(Flags::NO_LOAD);

    hera.rm("/heracles/load/*").expect("Failed to rm transforms");
    hera.set("/heracles/load/Fake/lens", Some("Fake.lns"))
        .expect("Failed to set lens");
    hera.set("/heracles/load/Fake/incl", Some("/fake"))
        .expect("Failed to set incl");
    hera.set("/files/fake/entry", Some("value"))
        .expect("Failed to set");

    assert!(hera.save().is_err());
    assert_eq!(hera.error(), ErrorCode::NoLens);
}

#[test]
fn save_multiple_transforms() {
    let (mut hera, _root) = init_hosts(Flags::empty());

    hera.set("/heracles/load/Hosts2/lens", Some("Hosts.lns"))
        .expect("Failed to set lens");
    hera.set("/heracles/load/Hosts2/incl", Some("/etc/hosts"))
        .expect("Failed to set incl");

    hera.set("/files/etc/hosts/1/ipaddr", Some("10.0.0.1"))
        .expect("Failed to set");

    assert!(hera.save().is_err());
    assert_eq!(hera.error(), ErrorCode::MXfm);
}

#[test]
fn save_updates_mtime() {
    let (mut hera, _root) = init_hosts(Flags::empty());

    hera.set("/files/etc/hosts/1/alias[last() + 1]", Some("new"))
        .expect("Failed to add alias");

    let (_, mtime1) = hera
        .get("/heracles/files/etc/hosts/mtime")
        .expect("Failed to get mtime");
    let mtime1 = mtime1.expect("mtime has no value");

    hera.save().expect("Failed to save");

    let (_, mtime2) = hera
        .get("/heracles/files/etc/hosts/mtime")
        .expect("Failed to get mtime");
    let mtime2 = mtime2.expect("mtime has no value");

    assert_ne!(mtime1, mtime2);
    assert_ne!(mtime2, "0");
}

// Loading and saving a file registered with a relative path works.
#[test]
fn save_relative_path() {
    let (mut hera, _root) = init_hosts(Flags::NO_LOAD);

    hera.rm("/heracles/load/*").expect("Failed to rm transforms");
    hera.set("/heracles/load/Hosts/lens", Some("Hosts.lns"))
        .expect("Failed to set lens");
    hera.set("/heracles/load/Hosts/incl", Some("etc/hosts"))
        .expect("Failed to set incl");
    hera.load().expect("Failed to load");

    assert_eq!(
        hera.count("/files/etc/hosts/1/alias[ . = 'new']").unwrap(),
        0
    );
    hera.set("/files/etc/hosts/1/alias[last() + 1]", Some("new"))
        .expect("Failed to add alias");

    hera.save().expect("Failed to save");
    assert_eq!(hera.count("/heracles//error").unwrap(), 0);

    // Force reloading the file.
    assert!(hera.rm("/heracles/files//mtime").unwrap() > 0);
    hera.load().expect("Failed to reload");

    assert_eq!(
        hera.count("/files/etc/hosts/1/alias[. = 'new']").unwrap(),
        1
    );
}

#[test]
fn save_backup_mode() {
    let (mut hera, root) = init_hosts(Flags::empty());

    hera.set("/heracles/save", Some("backup"))
        .expect("Failed to set save mode");
    hera.set("/files/etc/hosts/1/ipaddr", Some("127.0.0.2"))
        .expect("Failed to set");

    hera.save().expect("Failed to save");

    let saved = std::fs::read_to_string(
        root.path().join("etc").join("hosts.herasave"),
    )
    .expect("missing .herasave");
    assert_eq!(saved, HOSTS);
    let now = std::fs::read_to_string(hosts_path(&root)).unwrap();
    assert!(now.contains("127.0.0.2"));
    assert_eq!(hera.count("/heracles/events/saved").unwrap(), 1);
}

#[test]
fn save_noop_mode() {
    let (mut hera, root) = init_hosts(Flags::empty());

    hera.set("/heracles/save", Some("noop"))
        .expect("Failed to set save mode");
    hera.set("/files/etc/hosts/1/ipaddr", Some("127.0.0.2"))
        .expect("Failed to set");

    hera.save().expect("Failed to save");

    // Nothing is written, but the would-have-changed file is recorded.
    assert_eq!(
        std::fs::read_to_string(hosts_path(&root)).unwrap(),
        HOSTS
    );
    let (_, saved) = hera.get("/heracles/events/saved").unwrap();
    assert_eq!(saved.as_deref(), Some("/files/etc/hosts"));

    // The tree stays dirty, so a later save in overwrite mode writes.
    hera.set("/heracles/save", Some("overwrite"))
        .expect("Failed to set save mode");
    hera.save().expect("Failed to save");
    let now = std::fs::read_to_string(hosts_path(&root)).unwrap();
    assert!(now.contains("127.0.0.2"));
}

#[test]
fn save_invalid_mode() {
    let (mut hera, _root) = init_hosts(Flags::empty());

    hera.set("/heracles/save", Some("frobnicate"))
        .expect("Failed to set save mode");
    assert!(hera.save().is_err());
    assert_eq!(hera.error(), ErrorCode::Internal);
}

#[test]
fn save_removed_file_deletes_it() {
    let (mut hera, root) = init_hosts(Flags::empty());

    assert!(hera.rm("/files/etc/hosts").unwrap() > 0);
    hera.save().expect("Failed to save");

    assert!(!hosts_path(&root).exists());
    let (_, saved) = hera.get("/heracles/events/saved").unwrap();
    assert_eq!(saved.as_deref(), Some("/files/etc/hosts"));
    assert_eq!(hera.count("/heracles/files/etc/hosts").unwrap(), 0);
}

#[test]
fn save_removed_file_backup_mode() {
    let (mut hera, root) = init_hosts(Flags::SAVE_BACKUP);

    assert!(hera.rm("/files/etc/hosts").unwrap() > 0);
    hera.save().expect("Failed to save");

    assert!(!hosts_path(&root).exists());
    let saved = std::fs::read_to_string(
        root.path().join("etc").join("hosts.herasave"),
    )
    .expect("missing .herasave");
    assert_eq!(saved, HOSTS);
}

#[test]
fn save_put_error_reported() {
    let (mut hera, root) = init_hosts(Flags::empty());

    // An entry the lens cannot serialise: no fields at all.
    hera.set("/files/etc/hosts/3", None).expect("Failed to set");

    assert!(hera.save().is_err());

    let (_, status) = hera
        .get("/heracles/files/etc/hosts/error")
        .expect("Failed to get error status");
    assert_eq!(status.as_deref(), Some("put_failed"));
    assert_eq!(
        hera.count("/heracles/files/etc/hosts/error/message").unwrap(),
        1
    );
    let (_, epath) = hera
        .get("/heracles/files/etc/hosts/error/path")
        .expect("Failed to get error path");
    assert_eq!(epath.as_deref(), Some("/files/etc/hosts/3"));

    // The file is untouched.
    assert_eq!(
        std::fs::read_to_string(hosts_path(&root)).unwrap(),
        HOSTS
    );
}

#[test]
fn save_span_tracking() {
    let (mut hera, _root) = init_hosts(Flags::ENABLE_SPAN);

    let span = hera
        .span("/files/etc/hosts/1/ipaddr")
        .expect("Failed to get span");
    assert!(span.filename.ends_with("etc/hosts"));
    assert_eq!((span.value_start, span.value_end), (0, 9));
    assert_eq!((span.span_start, span.span_end), (0, 9));

    // The file node spans the entire file.
    let span =
        hera.span("/files/etc/hosts").expect("Failed to get span");
    assert_eq!(
        (span.span_start, span.span_end),
        (0, HOSTS.len() as u32)
    );

    // No match and multiple matches are reported as such.
    assert!(hera.span("/files/etc/hosts/*[ last() + 1 ]").is_err());
    assert_eq!(hera.error(), ErrorCode::NoMatch);
    assert!(hera.span("/files/etc/hosts/*").is_err());
    assert_eq!(hera.error(), ErrorCode::MMatch);
}

#[test]
fn span_disabled() {
    let (mut hera, _root) = init_hosts(Flags::empty());

    assert!(hera.span("/files/etc/hosts/1/ipaddr").is_err());
    assert_eq!(hera.error(), ErrorCode::NoSpan);
}

#[test]
fn text_store_and_retrieve() {
    let (mut hera, _root) = init_hosts(Flags::NO_LOAD);
    static TEXT: &str = "192.168.0.1 rtr.example.com router\n";

    hera.set("/raw/hosts", Some(TEXT)).expect("Failed to set");
    hera.text_store("Hosts.lns", "/raw/hosts", "/t1")
        .expect("Failed to store text");

    assert_eq!(hera.count("/t1/*").unwrap(), 1);
    let (_, value) = hera.get("/t1/1/canonical").unwrap();
    assert_eq!(value.as_deref(), Some("rtr.example.com"));

    // Unknown lenses are reported.
    assert!(hera
        .text_store("Notthere.lns", "/raw/hosts", "/t2")
        .is_err());
    assert_eq!(hera.error(), ErrorCode::NoLens);
    assert_eq!(hera.count("/t2").unwrap(), 0);

    // Parse errors leave a record under /heracles/text.
    hera.set("/raw/bad", Some("192.168.0.1")).unwrap();
    assert!(hera.text_store("Hosts.lns", "/raw/bad", "/t3").is_err());
    assert_eq!(hera.count("/t3").unwrap(), 0);
    let (_, status) = hera.get("/heracles/text/t3/error").unwrap();
    assert_eq!(status.as_deref(), Some("parse_failed"));

    // A successful store clears the error again.
    hera.set("/raw/bad", Some(TEXT)).unwrap();
    hera.text_store("Hosts.lns", "/raw/bad", "/t3")
        .expect("Failed to store fixed text");
    assert_eq!(hera.count("/heracles/text/t3/error").unwrap(), 0);

    // Invalid target paths are rejected.
    assert!(hera
        .text_store("Hosts.lns", "/raw/hosts", "[garbage]")
        .is_err());
    assert_eq!(hera.error(), ErrorCode::PathX);

    // And back out again.
    hera.text_retrieve("Hosts.lns", "/raw/hosts", "/t1", "/out/hosts")
        .expect("Failed to retrieve text");
    let (_, out) = hera.get("/out/hosts").unwrap();
    assert_eq!(out.as_deref(), Some(TEXT));
}

// mv from one managed subtree position to another behaves like copy
// plus remove, and the result survives a save/reload cycle.
#[test]
fn save_after_mv() {
    let (mut hera, _root) = init_hosts(Flags::empty());

    hera.set("/files/etc/hosts/3/ipaddr", Some("10.1.1.1"))
        .expect("Failed to set");
    hera.set("/files/etc/hosts/3/canonical", Some("third.example.com"))
        .expect("Failed to set");
    hera.mv("/files/etc/hosts/3", "/files/etc/hosts/2")
        .expect("Failed to move");

    assert_eq!(hera.count("/files/etc/hosts/*").unwrap(), 2);
    hera.save().expect("Failed to save");

    hera.rm("/heracles/files//mtime").expect("Failed to drop mtime");
    hera.load().expect("Failed to reload");
    assert_eq!(
        hera.count(
            "/files/etc/hosts/2[canonical = 'third.example.com']"
        )
        .unwrap(),
        1
    );
}

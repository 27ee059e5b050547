use heracles::{ErrorCode, Flags, Heracles};

fn create_engine() -> Heracles {
    Heracles::init(None, None, Flags::NO_STDINC | Flags::NO_LOAD)
        .expect("Failed to initialize engine")
}

#[test]
fn api_get() {
    let mut hera = create_engine();
    assert_eq!(hera.error(), ErrorCode::NoError);

    // Make sure we're looking at the right thing.
    let matches = hera
        .matches("/heracles/version/save/*")
        .expect("Failed to match save modes");
    assert!(matches.len() > 1);

    // get returns the value when exactly one node matches.
    let (exists, value) = hera
        .get("/heracles/version/save/*[1]")
        .expect("Failed to get first save mode");
    assert!(exists);
    assert!(value.is_some());
    assert_eq!(hera.error(), ErrorCode::NoError);

    // get reports no match without an error.
    let (exists, value) = hera
        .get("/heracles/version/save/*[ last() + 1 ]")
        .expect("Failed to get past-the-end save mode");
    assert!(!exists);
    assert_eq!(value, None);
    assert_eq!(hera.error(), ErrorCode::NoError);

    // get fails when multiple nodes match.
    assert!(hera.get("/heracles/version/save/*").is_err());
    assert_eq!(hera.error(), ErrorCode::MMatch);

    // Same rules for label.
    let (exists, label) = hera
        .label("/heracles/version/save/*[1]")
        .expect("Failed to get label");
    assert!(exists);
    assert_eq!(label.as_deref(), Some("mode"));

    let (exists, label) = hera
        .label("/heracles/version/save/*[ last() + 1 ]")
        .expect("Failed to get past-the-end label");
    assert!(!exists);
    assert_eq!(label, None);

    assert!(hera.label("/heracles/version/save/*").is_err());
    assert_eq!(hera.error(), ErrorCode::MMatch);
}

#[test]
fn api_get_context() {
    let mut hera = create_engine();

    // The context is prepended to relative paths.
    hera.set("/heracles/context", Some("/heracles/version"))
        .expect("Failed to set context");
    let (exists, value) =
        hera.get("save/*[1]").expect("Failed to get via context");
    assert!(exists);
    assert!(value.is_some());

    // An empty context leaves absolute paths working.
    hera.set("/heracles/context", Some(""))
        .expect("Failed to clear context");
    let (exists, _) = hera
        .get("/heracles/version")
        .expect("Failed to get with empty context");
    assert!(exists);

    // Trailing slashes in the context are ignored.
    hera.set("/heracles/context", Some("/heracles/version/"))
        .expect("Failed to set context");
    let (exists, _) =
        hera.get("save/*[1]").expect("Failed to get via context");
    assert!(exists);

    // A non-existent context path is created on demand.
    hera.set("/heracles/context", Some("/context/foo"))
        .expect("Failed to set context");
    hera.set("bar", Some("value")).expect("Failed to set via context");
    let (exists, value) = hera
        .get("/context/foo/bar")
        .expect("Failed to get created node");
    assert!(exists);
    assert_eq!(value.as_deref(), Some("value"));
}

#[test]
fn api_set() {
    let mut hera = create_engine();

    hera.set("/heracles/testSet", Some("foo"))
        .expect("Failed to set");
    let (_, value) =
        hera.get("/heracles/testSet").expect("Failed to get back");
    assert_eq!(value.as_deref(), Some("foo"));

    // set fails when multiple nodes match.
    assert!(hera.set("/heracles/version/save/*", Some("foo")).is_err());
    assert_eq!(hera.error(), ErrorCode::MMatch);

    // The context can be set even while it is invalid.
    hera.set("/heracles/context", Some("( /files | /heracles )"))
        .expect("Failed to set union context");
    assert!(hera.get("/heracles/version").is_err());
    assert_eq!(hera.error(), ErrorCode::MMatch);
    hera.set("/heracles/context", Some("/files"))
        .expect("Failed to restore context");
    assert_eq!(hera.error(), ErrorCode::NoError);
}

#[test]
fn api_setm() {
    let mut hera = create_engine();

    // Change base nodes when SUB is None.
    let r = hera
        .setm("/heracles/version/save/*", None, Some("changed"))
        .expect("Failed to setm");
    assert_eq!(r, 4);
    let r = hera
        .count("/heracles/version/save/*[. = 'changed']")
        .expect("Failed to count changed");
    assert_eq!(r, 4);

    // Only change existing nodes.
    let r = hera
        .setm("/heracles/version/save", Some("mode"), Some("again"))
        .expect("Failed to setm");
    assert_eq!(r, 4);
    assert_eq!(hera.count("/heracles/version/save/*").unwrap(), 4);
    assert_eq!(
        hera.count("/heracles/version/save/*[. = 'again']").unwrap(),
        4
    );

    // Create a new node.
    let r = hera
        .setm(
            "/heracles/version/save",
            Some("mode[last() + 1]"),
            Some("newmode"),
        )
        .expect("Failed to setm");
    assert_eq!(r, 1);
    assert_eq!(hera.count("/heracles/version/save/*").unwrap(), 5);
    assert_eq!(
        hera.count("/heracles/version/save/*[. = 'again']").unwrap(),
        4
    );
    assert_eq!(
        hera.count("/heracles/version/save/*[last()][. = 'newmode']")
            .unwrap(),
        1
    );

    // Nonexistent base.
    let r = hera
        .setm(
            "/heracles/version/save[last()+1]",
            Some("mode"),
            Some("newmode"),
        )
        .expect("Failed to setm on empty base");
    assert_eq!(r, 0);

    // Invalid path expressions.
    assert!(hera
        .setm("/heracles/version/save[]", Some("mode"), Some("invalid"))
        .is_err());
    assert!(hera
        .setm("/heracles/version/save/*", Some("mode[]"), Some("invalid"))
        .is_err());
}

// Defining a variable creates a corresponding entry under
// /heracles/variables, which disappears when the variable is undefined.
#[test]
fn api_defvar_meta() {
    let mut hera = create_engine();
    static EXPR: &str = "/heracles/version/save/mode";

    let r = hera.defvar("var", Some(EXPR)).expect("Failed to defvar");
    assert_eq!(r, 4);

    assert_eq!(hera.count("/heracles/variables/*").unwrap(), 1);
    let (_, value) = hera
        .get("/heracles/variables/var")
        .expect("Failed to get variable meta");
    assert_eq!(value.as_deref(), Some(EXPR));

    let r = hera.defvar("var", None).expect("Failed to undefine");
    assert_eq!(r, 0);
    assert_eq!(hera.count("/heracles/variables/*").unwrap(), 0);
}

#[test]
fn api_defnode_existing_meta() {
    let mut hera = create_engine();
    static EXPR: &str = "/heracles/version/save/mode";

    let (r, created) = hera
        .defnode("var", EXPR, Some("other"))
        .expect("Failed to defnode");
    assert_eq!(r, 4);
    assert!(!created);

    assert_eq!(hera.count("/heracles/variables/*").unwrap(), 1);
    let (_, value) = hera
        .get("/heracles/variables/var")
        .expect("Failed to get variable meta");
    assert_eq!(value.as_deref(), Some(EXPR));

    hera.defvar("var", None).expect("Failed to undefine");
    assert_eq!(hera.count("/heracles/variables/*").unwrap(), 0);
}

#[test]
fn api_defnode_create_meta() {
    let mut hera = create_engine();
    static EXPR: &str = "/heracles/version/save/mode[last()+1]";
    static EXPR_CANONICAL: &str = "/heracles/version/save/mode[5]";

    let (r, created) = hera
        .defnode("var", EXPR, Some("other"))
        .expect("Failed to defnode");
    assert_eq!(r, 1);
    assert!(created);

    assert_eq!(hera.count("/heracles/variables/*").unwrap(), 1);
    let (_, value) = hera
        .get("/heracles/variables/var")
        .expect("Failed to get variable meta");
    assert_eq!(value.as_deref(), Some(EXPR_CANONICAL));

    // The binding points at the created node.
    let (_, value) = hera.get("$var").expect("Failed to get via binding");
    assert_eq!(value.as_deref(), Some("other"));

    hera.defvar("var", None).expect("Failed to undefine");
    assert_eq!(hera.count("/heracles/variables/*").unwrap(), 0);
}

#[test]
fn api_mv_descendant_guard() {
    let mut hera = create_engine();

    hera.set("/a/b/c", Some("value")).expect("Failed to set");

    assert!(hera.mv("/a/b/c", "/a/b/c/d").is_err());
    assert_eq!(hera.error(), ErrorCode::MvDesc);
}

#[test]
fn api_mv() {
    let mut hera = create_engine();

    hera.set("/x/y", Some("v")).expect("Failed to set");
    hera.set("/x/y/sub", Some("s")).expect("Failed to set");
    hera.mv("/x/y", "/x/z").expect("Failed to move");

    assert_eq!(hera.count("/x/y").unwrap(), 0);
    let (_, value) = hera.get("/x/z").expect("Failed to get moved node");
    assert_eq!(value.as_deref(), Some("v"));
    let (_, value) =
        hera.get("/x/z/sub").expect("Failed to get moved child");
    assert_eq!(value.as_deref(), Some("s"));
}

#[test]
fn api_rename() {
    let mut hera = create_engine();

    hera.set("/a/b/c", Some("value")).expect("Failed to set");

    let r = hera.rename("/a/b/c", "d").expect("Failed to rename");
    assert_eq!(r, 1);

    hera.set("/a/e/d", Some("value2")).expect("Failed to set");

    // Multiple rename.
    let r = hera.rename("/a//d", "x").expect("Failed to rename");
    assert_eq!(r, 2);

    // Label with a /.
    assert!(hera.rename("/a/e/x", "a/b").is_err());
    assert_eq!(hera.error(), ErrorCode::Label);
    assert_eq!(hera.count("/a/e/x").unwrap(), 1);
}

#[test]
fn api_rm() {
    let mut hera = create_engine();

    hera.set("/r/s/t", Some("v")).expect("Failed to set");
    let r = hera.rm("/r/s").expect("Failed to rm");
    assert_eq!(r, 2);
    assert_eq!(hera.count("/r/s").unwrap(), 0);
    assert_eq!(hera.count("/r").unwrap(), 1);
}

#[test]
fn api_insert() {
    let mut hera = create_engine();

    hera.set("/i/a", Some("1")).expect("Failed to set");
    hera.insert("/i/a", "b", true).expect("Failed to insert");
    hera.insert("/i/a", "c", false).expect("Failed to insert");

    assert_eq!(
        hera.matches("/i/*").expect("Failed to match"),
        vec!["/i/b", "/i/a", "/i/c"]
    );

    assert!(hera.insert("/i/a", "x/y", true).is_err());
    assert_eq!(hera.error(), ErrorCode::Label);

    assert!(hera.insert("/i/missing", "b", true).is_err());
    assert_eq!(hera.error(), ErrorCode::NoMatch);
}

#[test]
fn api_set_get_roundtrip() {
    let mut hera = create_engine();

    for (path, value) in &[
        ("/files/etc/hosts/1/ipaddr", "127.0.0.1"),
        ("/files/etc/hosts/1/canonical", "localhost"),
        ("/heracles/deep/ly/nested/node", "deep"),
    ] {
        hera.set(path, Some(value)).expect("Failed to set");
        let (exists, got) = hera.get(path).expect("Failed to get");
        assert!(exists);
        assert_eq!(got.as_deref(), Some(*value));
    }
}

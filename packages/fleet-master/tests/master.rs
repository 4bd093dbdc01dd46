//! Authorization and application-registry behaviour.

use fleet_master::{AppFilter, AppMode, AppStatus, AppUpdate, MasterServer};

fn master() -> (MasterServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let master = MasterServer::open(dir.path()).unwrap();
    master
        .add_user("jdoe", "/DC=org/DC=example/CN=John Doe", "jdoe@example.org")
        .unwrap();
    master
        .add_user("operator", "/DC=org/DC=example/CN=Op", "ops@example.org")
        .unwrap();
    master.add_role("production").unwrap();
    master.add_authorization_target("copy").unwrap();
    master.add_authorization_target("deletion").unwrap();
    (master, dir)
}

#[test]
fn identify_user_by_dn_and_truncation() {
    let (master, _dir) = master();

    let found = master
        .identify_user(Some("/DC=org/DC=example/CN=John Doe"), None, false)
        .unwrap()
        .unwrap();
    assert_eq!(found.0, "jdoe");

    // comma form normalizes to the same DN
    let found = master
        .identify_user(Some("DC = org, DC = example, CN = John Doe"), None, false)
        .unwrap()
        .unwrap();
    assert_eq!(found.0, "jdoe");

    // a truncated DN only matches with check_trunc
    assert!(master
        .identify_user(Some("/DC=org/DC=example"), None, false)
        .unwrap()
        .is_none());
    let found = master
        .identify_user(Some("/DC=org/DC=example"), None, true)
        .unwrap();
    assert!(found.is_some());

    assert!(master
        .identify_user(Some("/DC=org/DC=nowhere/CN=Ghost"), None, false)
        .unwrap()
        .is_none());

    let by_name = master.identify_user(None, Some("jdoe"), false).unwrap();
    assert_eq!(by_name.unwrap().0, "jdoe");
}

#[test]
fn wildcard_authorization_dimensions() {
    let (master, _dir) = master();

    // jdoe: production role on the copy target only
    master
        .authorize_user("jdoe", Some("production"), Some("copy"))
        .unwrap();
    // operator: wildcard on both dimensions
    master.authorize_user("operator", None, None).unwrap();

    assert!(master.check_user_auth("jdoe", Some("production"), Some("copy")));
    assert!(!master.check_user_auth("jdoe", Some("production"), Some("deletion")));
    // None asks across the dimension
    assert!(master.check_user_auth("jdoe", None, Some("copy")));
    assert!(master.check_user_auth("jdoe", Some("production"), None));

    assert!(master.check_user_auth("operator", Some("production"), Some("deletion")));
    assert!(master.check_user_auth("operator", None, None));

    assert!(!master.check_user_auth("ghost", None, None));

    let auth = master.list_user_auth("operator");
    assert_eq!(auth, vec![(None, None)]);

    let users = master.list_authorized_users(Some("copy"));
    assert!(users.iter().any(|(u, _)| u == "jdoe"));
    assert!(users.iter().any(|(u, _)| u == "operator"));
}

#[test]
fn write_auth_accepts_wildcard_and_owner_rows() {
    let (master, _dir) = master();
    let content = b"#!/bin/sh\necho update\n";
    let jdoe = master.identify_user(None, Some("jdoe"), false).unwrap().unwrap();
    let operator = master
        .identify_user(None, Some("operator"), false)
        .unwrap()
        .unwrap();

    // owner-specific row: only jdoe passes
    master
        .add_authorized_executable("sync", content, Some("jdoe"))
        .unwrap();
    assert!(master.check_write_auth("sync", jdoe.1, content));
    assert!(!master.check_write_auth("sync", operator.1, content));

    // wildcard row: everyone passes
    master
        .add_authorized_executable("report", content, None)
        .unwrap();
    assert!(master.check_write_auth("report", jdoe.1, content));
    assert!(master.check_write_auth("report", operator.1, content));

    // different content is rejected either way
    assert!(!master.check_write_auth("sync", jdoe.1, b"tampered"));
    assert!(!master.check_write_auth("report", jdoe.1, b"tampered"));
}

#[test]
fn application_lifecycle() {
    let (master, _dir) = master();

    let app_id = master
        .schedule_app(AppMode::Asynch, "t1", "/tmp/work/1", "jdoe", "", false)
        .unwrap();

    let pending = master.get_applications(AppFilter {
        status: Some(AppStatus::New),
        ..Default::default()
    });
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, app_id);
    assert_eq!(pending[0].user, "jdoe");

    master
        .update_application(
            app_id,
            AppUpdate {
                status: Some(AppStatus::Run),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(master.get_application(app_id).unwrap().status, AppStatus::Run);

    master
        .update_application(
            app_id,
            AppUpdate {
                status: Some(AppStatus::Done),
                exit_code: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
    let done = master.get_application(app_id).unwrap();
    assert_eq!(done.status, AppStatus::Done);
    assert_eq!(done.exit_code, Some(0));
    assert!(done.status.is_terminal());

    // oldest-first ordering for the daemon poll
    let second = master
        .schedule_app(AppMode::Asynch, "t2", "/tmp/work/2", "operator", "", false)
        .unwrap();
    let pending = master.get_applications(AppFilter {
        status: Some(AppStatus::New),
        ..Default::default()
    });
    assert_eq!(pending.first().unwrap().id, second);

    assert!(master.get_application(999).is_err());

    // scheduling for an unknown user is refused
    assert!(master
        .schedule_app(AppMode::Asynch, "t3", "/tmp/work/3", "ghost", "", false)
        .is_err());
}

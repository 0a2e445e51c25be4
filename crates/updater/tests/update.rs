// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! End-to-end exercises against a local HTTP server: build a package with
//! [`autoupdater::build_package`], serve it, then check, install, verify
//! and select it.

use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use autoupdater::{
    build_package, Config, PackageVersion, ReleaseType, UpdateInfo, Updater, UpdaterBuilder,
    MANIFEST_NAME, PACKAGE_NAME,
};
use rsa::{
    pkcs8::{EncodePublicKey, LineEnding},
    RsaPrivateKey,
};

struct Fixture {
    key: RsaPrivateKey,
    root: PathBuf,
    app_dir: PathBuf,
    port: u16,
    _dir: tempfile::TempDir,
}

/// Builds a 2.1.0.0 package out of a small app tree, then serves the signed
/// manifest and the package over a local HTTP server. `mangle` may corrupt
/// the served bodies.
fn fixture(mangle: fn(&str, Vec<u8>) -> Vec<u8>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();

    let app_dir = dir.path().join("app");
    fs::create_dir_all(app_dir.join("data")).unwrap();
    fs::write(app_dir.join("app.bin"), b"app v2 binary").unwrap();
    fs::write(app_dir.join("data/readme.txt"), b"hello").unwrap();

    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().to_ip().unwrap().port();

    let out_dir = dir.path().join("server");
    let base = UpdateInfo {
        displayname: "E2E App".into(),
        version: PackageVersion::parse("2.1.0.0"),
        release_type: "Stable".into(),
        remote_urls: Some(vec![format!("http://127.0.0.1:{port}/{PACKAGE_NAME}")]),
        ..Default::default()
    };
    build_package(&app_dir, &out_dir, &base, &key).unwrap();

    let served = out_dir.clone();
    thread::spawn(move || {
        while let Ok(request) = server.recv() {
            // the manifest is served on every channel path
            let (name, file) = if request.url().ends_with("/autoupdate.manifest") {
                ("manifest", served.join(MANIFEST_NAME))
            } else if request.url() == "/package.zip" {
                ("package", served.join(PACKAGE_NAME))
            } else {
                let _ = request.respond(tiny_http::Response::empty(404));
                continue;
            };
            match fs::read(file) {
                Ok(body) => {
                    let _ = request.respond(tiny_http::Response::from_data(mangle(name, body)));
                }
                Err(_) => {
                    let _ = request.respond(tiny_http::Response::empty(404));
                }
            }
        }
    });

    let root = dir.path().join("update-root");
    Fixture {
        key,
        root,
        app_dir,
        port,
        _dir: dir,
    }
}

fn updater(fixture: &Fixture, app_name: &str, errors: Option<Arc<AtomicUsize>>) -> Updater {
    std::env::set_var(
        format!(
            "AUTOUPDATER_{}_UPDATE_ROOT",
            app_name.to_uppercase().replace('-', "_")
        ),
        &fixture.root,
    );

    let config = Config {
        app_name: app_name.into(),
        display_name: "E2E App".into(),
        endpoints: vec![format!(
            "http://127.0.0.1:{}/stable/autoupdate.manifest",
            fixture.port
        )
        .parse()
        .unwrap()],
        pubkey: fixture
            .key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap(),
        channel: ReleaseType::Stable,
        release_type: "Stable".into(),
        ..Default::default()
    };

    let mut builder = UpdaterBuilder::new(PackageVersion::parse("1.0.0.0"), config)
        .executable_path(fixture.app_dir.join("app.bin"));
    if let Some(errors) = errors {
        builder = builder.on_error(move |_| {
            errors.fetch_add(1, Ordering::SeqCst);
        });
    }
    builder.build().unwrap()
}

fn untouched(_: &str, body: Vec<u8>) -> Vec<u8> {
    body
}

#[test]
fn happy_path_install() {
    let fixture = fixture(untouched);
    let updater = updater(&fixture, "e2e-happy", None);

    let update = updater
        .check_for_update(ReleaseType::Stable)
        .expect("an update should be offered");
    assert_eq!(update.version, PackageVersion::parse("2.1.0.0"));
    assert!(update.files.is_none());
    assert_eq!(updater.last_check().unwrap().version, update.version);

    assert!(updater.download_and_unpack(&update));

    let installed = fixture.root.join("2.1.0.0");
    assert!(installed.join(MANIFEST_NAME).is_file());
    assert!(installed.join("app.bin").is_file());
    assert_eq!(
        fs::read_to_string(fixture.root.join("current")).unwrap(),
        "2.1.0.0"
    );
    assert!(updater.verify_unpacked(&installed, None));
    assert!(updater.has_installed_update());

    let best = updater.get_best_version(true);
    assert_eq!(best.folder, installed);
    assert_eq!(best.version, PackageVersion::parse("2.1.0.0"));
}

#[test]
fn corrupted_package_is_rejected() {
    fn flip_package_byte(name: &str, mut body: Vec<u8>) -> Vec<u8> {
        if name == "package" {
            body[123] ^= 0x01;
        }
        body
    }
    let fixture = fixture(flip_package_byte);
    let errors = Arc::new(AtomicUsize::new(0));
    let updater = updater(&fixture, "e2e-corrupt", Some(errors.clone()));

    let update = updater
        .check_for_update(ReleaseType::Stable)
        .expect("the manifest itself is intact");
    assert!(!updater.download_and_unpack(&update));

    // nothing may have been promoted
    assert!(!fixture.root.join("2.1.0.0").exists());
    assert!(!fixture.root.join("current").exists());
    assert!(errors.load(Ordering::SeqCst) >= 1);

    // the supervisor would carry on with the baseline version
    let best = updater.get_best_version(true);
    assert_eq!(best.folder, dunce::canonicalize(&fixture.app_dir).unwrap());
    assert_eq!(best.version, PackageVersion::parse("1.0.0.0"));
}

#[test]
fn tampered_manifest_signature_yields_no_update() {
    fn flip_signature_byte(name: &str, mut body: Vec<u8>) -> Vec<u8> {
        if name == "manifest" {
            // inside the signature block, right after the length header
            body[6] ^= 0x01;
        }
        body
    }
    let fixture = fixture(flip_signature_byte);
    let errors = Arc::new(AtomicUsize::new(0));
    let updater = updater(&fixture, "e2e-badsig", Some(errors.clone()));

    assert!(updater.check_for_update(ReleaseType::Stable).is_none());
    // one error event per candidate endpoint
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[test]
fn built_package_roundtrips_through_the_installer() {
    let fixture = fixture(untouched);
    let updater = updater(&fixture, "e2e-roundtrip", None);

    let update = updater.check_for_update(ReleaseType::Stable).unwrap();
    assert!(updater.download_and_unpack(&update));

    let installed = fixture.root.join("2.1.0.0");
    // the unpacked tree matches the input tree byte for byte
    assert_eq!(
        fs::read(installed.join("app.bin")).unwrap(),
        fs::read(fixture.app_dir.join("app.bin")).unwrap()
    );
    assert_eq!(
        fs::read(installed.join("data/readme.txt")).unwrap(),
        fs::read(fixture.app_dir.join("data/readme.txt")).unwrap()
    );

    // and still verifies after the copy
    assert!(updater.verify_unpacked(&installed, Some(&update)));
}

#[test]
fn stricter_channel_never_accepts_a_looser_release() {
    let fixture = fixture(untouched);
    let updater = updater(&fixture, "e2e-channel", None);

    // the served manifest says Stable, so asking for stable works...
    assert!(updater.check_for_update(ReleaseType::Stable).is_some());
    // ...but a Debug-track channel request never accepts it
    assert!(updater.check_for_update(ReleaseType::Debug).is_none());
}

mod common;

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use sealwrap::{BlobInfo, Context, Error, Options, WrappingService, config::MapEnv, metadata::NoMetadata};

use common::{Recorded, json_field, serve};

const KEY: &str = "projects/proj/locations/global/keyRings/ring/cryptoKeys/seal";
const ALL_PERMISSIONS: &str = r#"{"permissions":[
    "cloudkms.cryptoKeyVersions.useToEncrypt",
    "cloudkms.cryptoKeyVersions.useToDecrypt",
    "cloudkms.cryptoKeys.get"]}"#;

fn options(endpoint: &str) -> Options {
    [
        ("type", "gcpckms"),
        ("endpoint", endpoint),
        ("project", "proj"),
        ("key_ring", "ring"),
        ("crypto_key", "seal"),
        ("access_token", "gcp-test-token"),
        ("disallow_env_vars", "true"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn fake_ciphertext(plaintext_b64: &str) -> String {
    STANDARD.encode(format!("gcp|{plaintext_b64}"))
}

/// Primary version 1; `:encrypt` answers with version 2.
fn kms(rq: &Recorded) -> (u16, String) {
    let path = rq.url.split('?').next().unwrap_or_default();
    let resource = path.strip_prefix("/v1/").unwrap_or_default();
    if resource == format!("{KEY}:testIamPermissions") {
        (200, ALL_PERMISSIONS.into())
    } else if resource == KEY && rq.method == "GET" {
        (
            200,
            format!(r#"{{"name":"{KEY}","primary":{{"name":"{KEY}/cryptoKeyVersions/1"}}}}"#),
        )
    } else if resource == format!("{KEY}:encrypt") {
        let ciphertext = fake_ciphertext(&json_field(&rq.body, "plaintext"));
        (
            200,
            format!(r#"{{"name":"{KEY}/cryptoKeyVersions/2","ciphertext":"{ciphertext}"}}"#),
        )
    } else if resource == format!("{KEY}:decrypt") {
        let raw = STANDARD
            .decode(json_field(&rq.body, "ciphertext"))
            .unwrap_or_default();
        match String::from_utf8_lossy(&raw).strip_prefix("gcp|") {
            Some(plaintext) => (200, format!(r#"{{"plaintext":"{plaintext}"}}"#)),
            None => (
                400,
                r#"{"error":{"code":400,"status":"INVALID_ARGUMENT","message":"Decryption failed"}}"#
                    .into(),
            ),
        }
    } else {
        (
            404,
            r#"{"error":{"code":404,"status":"NOT_FOUND","message":"not found"}}"#.into(),
        )
    }
}

fn service() -> WrappingService {
    let _ = env_logger::builder().is_test(true).try_init();
    WrappingService::with_sources(Arc::new(MapEnv::new()), Arc::new(NoMetadata))
}

#[test]
fn key_id_is_the_version_reported_by_encrypt() {
    let server = serve(kms);
    let svc = service();
    let ctx = Context::background();

    svc.configure(&ctx, &options(&server.url)).unwrap();
    assert_eq!(svc.current_key_id(), format!("{KEY}/cryptoKeyVersions/1"));

    let blob = svc.encrypt(&ctx, b"unseal key", Some(b"aad")).unwrap();
    assert_eq!(blob.key_id(), Some(format!("{KEY}/cryptoKeyVersions/2").as_str()));
    assert_eq!(svc.current_key_id(), format!("{KEY}/cryptoKeyVersions/2"));
    assert_eq!(svc.decrypt(&ctx, &blob, Some(b"aad")).unwrap(), b"unseal key");

    let requests = server.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[0].url, format!("/v1/{KEY}:testIamPermissions"));
    for rq in &requests {
        assert_eq!(rq.header("Authorization"), Some("Bearer gcp-test-token"));
    }
}

#[test]
fn missing_permissions_are_unauthorized() {
    let server = serve(|rq| {
        if rq.url.ends_with(":testIamPermissions") {
            (
                200,
                r#"{"permissions":["cloudkms.cryptoKeyVersions.useToEncrypt"]}"#.into(),
            )
        } else {
            kms(rq)
        }
    });
    let svc = service();
    let err = svc
        .configure(&Context::background(), &options(&server.url))
        .unwrap_err();
    match err {
        Error::Unauthorized(message) => {
            assert!(message.contains("cloudkms.cryptoKeyVersions.useToDecrypt"), "{message}");
            assert!(message.contains("cloudkms.cryptoKeys.get"), "{message}");
            assert!(!message.contains("useToEncrypt"), "{message}");
        }
        other => panic!("expected Unauthorized, got {other:?}"),
    }
    assert_eq!(svc.current_key_id(), "");
}

#[test]
fn legacy_blobs_use_cloud_kms_decrypt() {
    let server = serve(kms);
    let svc = service();
    let ctx = Context::background();
    svc.configure(&ctx, &options(&server.url)).unwrap();

    let ciphertext = STANDARD
        .decode(fake_ciphertext(&STANDARD.encode(b"legacy secret")))
        .unwrap();
    let plaintext = svc.decrypt(&ctx, &BlobInfo::direct(ciphertext), None).unwrap();
    assert_eq!(plaintext, b"legacy secret");

    let err = svc
        .decrypt(&ctx, &BlobInfo::direct(b"not ours".to_vec()), None)
        .unwrap_err();
    assert!(matches!(err, Error::DecryptionFailure(_)));
}

#[test]
fn quota_exhaustion_is_rate_limited() {
    let server = serve(|rq| {
        if rq.url.ends_with(":encrypt") {
            (
                429,
                r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","message":"quota"}}"#.into(),
            )
        } else {
            kms(rq)
        }
    });
    let svc = service();
    let ctx = Context::background();
    svc.configure(&ctx, &options(&server.url)).unwrap();
    assert!(matches!(svc.encrypt(&ctx, b"x", None), Err(Error::RateLimited(_))));
    assert_eq!(svc.current_key_id(), format!("{KEY}/cryptoKeyVersions/1"));
}

#[test]
fn service_account_exchanges_signed_assertion_once() {
    let server = serve(|rq| {
        if rq.url == "/token" {
            (200, r#"{"access_token":"sa-token","expires_in":3600}"#.into())
        } else {
            kms(rq)
        }
    });
    let token_uri = format!("{}/token", server.url);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sa.json");
    let account = serde_json::json!({
        "type": "service_account",
        "client_email": "seal@proj.iam.gserviceaccount.com",
        "private_key": include_str!("fixtures/service-account.pem"),
        "token_uri": token_uri,
    });
    std::fs::write(&path, account.to_string()).unwrap();

    let mut opts = options(&server.url);
    opts.remove("access_token");
    opts.insert("credentials".into(), path.display().to_string());

    let svc = service();
    let ctx = Context::background();
    let summary = svc.configure(&ctx, &opts).unwrap();
    assert_eq!(summary.get("auth").map(String::as_str), Some("service-account"));
    let blob = svc.encrypt(&ctx, b"x", None).unwrap();
    assert_eq!(svc.decrypt(&ctx, &blob, None).unwrap(), b"x");

    let requests = server.requests();
    assert_eq!(server.count("/token"), 1);
    for rq in requests.iter().filter(|rq| rq.url != "/token") {
        assert_eq!(rq.header("Authorization"), Some("Bearer sa-token"));
    }

    let grant = requests.iter().find(|rq| rq.url == "/token").unwrap();
    let form: Vec<(String, String)> = url::form_urlencoded::parse(grant.body.as_bytes())
        .into_owned()
        .collect();
    let field = |name: &str| {
        form.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    assert_eq!(field("grant_type"), "urn:ietf:params:oauth:grant-type:jwt-bearer");

    let public = DecodingKey::from_rsa_pem(include_bytes!("fixtures/service-account.pub.pem")).unwrap();
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[token_uri.as_str()]);
    let claims = jsonwebtoken::decode::<serde_json::Value>(&field("assertion"), &public, &validation)
        .unwrap()
        .claims;
    assert_eq!(claims["iss"], "seal@proj.iam.gserviceaccount.com");
    assert_eq!(claims["scope"], "https://www.googleapis.com/auth/cloudkms");
}

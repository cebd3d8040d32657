use std::time::Duration;

use anyhow::{Context as _, bail};
use sealwrap::{Context, Options, WrappingService, codec};

const PROBE: &[u8] = b"sealcheck probe";
const PROBE_AAD: &[u8] = b"sealcheck";

/// `key=value` arguments become backend options; `type` defaults to the
/// in-process mock when neither the arguments nor `KMS_TYPE` name one.
fn parse_args() -> anyhow::Result<Options> {
    let mut options = Options::new();
    for arg in std::env::args().skip(1) {
        let Some((key, value)) = arg.split_once('=') else {
            bail!("expected key=value, got {arg:?}");
        };
        options.insert(key.trim().to_string(), value.to_string());
    }
    if !options.contains_key("type") && std::env::var_os("KMS_TYPE").is_none() {
        options.insert("type".into(), "mock".into());
    }
    Ok(options)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("=== sealwrap smoke check ===\n");
    let options = parse_args()?;
    let ctx = Context::timeout(Duration::from_secs(30));
    let service = WrappingService::new();

    println!("--- configure ---");
    let summary = service.configure(&ctx, &options).context("configure")?;
    for (key, value) in &summary {
        println!("  {key} = {value}");
    }
    println!("✓ {} backend ready\n", service.backend_type()?);

    println!("--- encrypt ---");
    let blob = service
        .encrypt(&ctx, PROBE, Some(PROBE_AAD))
        .context("encrypt")?;
    let encoded = codec::encode(&blob)?;
    println!("  key id       {}", service.current_key_id());
    println!("  wrapped key  {} bytes", blob.key_info.as_ref().map_or(0, |k| k.wrapped_key.len()));
    println!("  encoded blob {} bytes", encoded.len());
    println!("✓ sealed\n");

    println!("--- decrypt ---");
    let parsed = codec::decode(&encoded)?;
    let (plaintext, up_to_date) = service
        .decrypt_checked(&ctx, &parsed, Some(PROBE_AAD))
        .context("decrypt")?;
    if plaintext != PROBE {
        bail!("round trip returned different plaintext");
    }
    println!("  up to date   {up_to_date}");
    println!("✓ unsealed\n");

    service.close();
    log::info!("smoke check passed");
    println!("=== all checks passed ===");
    Ok(())
}

//! Generate a self-signed listener certificate for `wss://` listeners
//!
//! cargo run --bin gen_cert -- --name tunnel.local --out certs

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Generate a self-signed certificate for the WebSocket listener")]
struct Args {
    /// Host names or IP addresses the certificate is valid for
    #[arg(short, long = "name", default_value = "localhost")]
    names: Vec<String>,

    /// Output directory
    #[arg(short, long, default_value = "certs")]
    out: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    println!("Generating self-signed certificate for {:?}...", args.names);

    let generated = ech_tunnel::cert::generate_self_signed(&args.names)?;

    fs::create_dir_all(&args.out)?;

    let cert_path = args.out.join("server.crt");
    fs::write(&cert_path, &generated.cert_pem)?;
    println!("Certificate written to: {}", cert_path.display());

    let key_path = args.out.join("server.key");
    fs::write(&key_path, &generated.key_pem)?;
    println!("Private key written to: {}", key_path.display());

    // DER copy for clients that pin the certificate
    let der_path = args.out.join("server.der");
    fs::write(&der_path, generated.cert_der.as_ref())?;
    println!("Certificate (DER) written to: {}", der_path.display());

    println!(
        "\nDone! Start with --cert {} --key {}",
        cert_path.display(),
        key_path.display()
    );
    Ok(())
}

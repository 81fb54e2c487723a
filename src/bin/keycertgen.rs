//! Generates an ECDSA P-256 key pair and an X.509 certificate, optionally
//! self-signed as a CA. Not used by the proxy at runtime — it only produces
//! the PEM material the proxy later loads (client CA pool, server cert/key).

use anyhow::{Context, Result};
use clap::Parser;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType,
    PKCS_ECDSA_P256_SHA256,
};

#[derive(Parser, Debug)]
#[command(name = "keycertgen", about = "Generate ECDSA P-256 keys and X.509 certificates")]
struct Args {
    /// Output path for the generated private key (PKCS#8 PEM).
    #[arg(long, default_value = "key.pem")]
    key: String,

    /// Output path for the generated certificate (PEM).
    #[arg(long, default_value = "cert.pem")]
    cert: String,

    /// Subject Common Name for the generated certificate.
    #[arg(long, default_value = "default@default.org")]
    common_name: String,

    /// Generate a self-signed CA certificate instead of a leaf certificate.
    #[arg(long)]
    ca: bool,

    /// Path to the signing CA's private key (required unless --ca).
    #[arg(long)]
    parent_key: Option<String>,

    /// Path to the signing CA's certificate (required unless --ca).
    #[arg(long)]
    parent_cert: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (cert_pem, key_pem) = generate(&args)?;

    std::fs::write(&args.cert, cert_pem).with_context(|| format!("writing '{}'", args.cert))?;
    println!("created {}", args.cert);
    std::fs::write(&args.key, key_pem).with_context(|| format!("writing '{}'", args.key))?;
    println!("created {}", args.key);

    Ok(())
}

fn leaf_params(common_name: &str, is_ca: bool) -> CertificateParams {
    let mut params = CertificateParams::new(vec!["localhost".to_string()]);
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.subject_alt_names = vec![SanType::DnsName("localhost".to_string())];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Galley");
    dn.push(DnType::CountryName, "US");
    params.distinguished_name = dn;
    params.is_ca = if is_ca {
        IsCa::Ca(rcgen::BasicConstraints::Unconstrained)
    } else {
        IsCa::NoCa
    };
    params
}

/// Builds the requested certificate/key pair and returns them as PEM text,
/// without touching the filesystem — kept separate from `main` so the
/// generation logic itself is testable.
fn generate(args: &Args) -> Result<(String, String)> {
    let cert = Certificate::from_params(leaf_params(&args.common_name, args.ca))
        .context("building certificate parameters")?;

    if args.ca {
        return Ok((
            cert.serialize_pem().context("self-signing CA certificate")?,
            cert.serialize_private_key_pem(),
        ));
    }

    let parent_key_path = args
        .parent_key
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--parent-key is required unless --ca is set"))?;
    let parent_cert_path = args
        .parent_cert
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--parent-cert is required unless --ca is set"))?;

    let issuer = load_issuer(parent_key_path, parent_cert_path)?;
    Ok((
        cert.serialize_pem_with_signer(&issuer)
            .context("signing certificate with parent CA")?,
        cert.serialize_private_key_pem(),
    ))
}

/// Reconstructs the CA as an rcgen `Certificate` so it can act as a signer:
/// rcgen needs the CA's key pair plus a matching subject, which we recover
/// from the CA's own certificate rather than trusting caller-supplied
/// metadata.
fn load_issuer(parent_key_path: &str, parent_cert_path: &str) -> Result<Certificate> {
    let key_pem = std::fs::read_to_string(parent_key_path)
        .with_context(|| format!("reading '{parent_key_path}'"))?;
    let cert_der = std::fs::read(parent_cert_path).with_context(|| format!("reading '{parent_cert_path}'"))?;

    let (_, pem) = x509_parser::pem::parse_x509_pem(&cert_der)
        .map_err(|_| anyhow::anyhow!("could not parse parent certificate '{parent_cert_path}'"))?;
    let parsed = pem
        .parse_x509()
        .map_err(|_| anyhow::anyhow!("could not parse parent certificate '{parent_cert_path}'"))?;

    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("CA");

    let mut params = CertificateParams::new(vec![]);
    params.alg = &PKCS_ECDSA_P256_SHA256;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_pair = Some(KeyPair::from_pem(&key_pem).context("parsing parent private key")?);

    Certificate::from_params(params).context("reconstructing parent CA as a signer")
}

use std::{fs, path::PathBuf, process, sync::Arc};

use anyhow::{anyhow, Context};
use structopt::StructOpt;
use tracing_subscriber::*;

use fedagg::{
    common::{SystemClock, Version},
    crypto::{self, ByteObject, PublicSigningKey, SecretSigningKey, SigningKeyPair},
    registry::{FileStore, ModelRegistry, SignedPackage},
    settings::{RegistrySettings, Settings},
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "fedagg")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str), default_value = "configs/config.toml")]
    config_path: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Generates the registry signing key and writes it to the configured key file
    Keygen,
    /// Publishes the initial model version from a JSON array of parameters
    Bootstrap {
        #[structopt(parse(from_os_str))]
        parameters: PathBuf,
    },
    /// Writes a signed model package to a file
    Export {
        /// The version to export, the active one if omitted
        #[structopt(short, long)]
        version: Option<Version>,
        #[structopt(parse(from_os_str))]
        out: PathBuf,
    },
    /// Verifies a signed model package against a hex encoded public key
    Verify {
        #[structopt(parse(from_os_str))]
        package: PathBuf,
        public_key: String,
    },
    /// Republishes the parameters of an earlier version as a new version
    Rollback { target: Version },
    /// Lists the published versions
    Status,
}

fn main() {
    let opt = Opt::from_args();

    let Settings {
        registry: registry_settings,
        log: log_settings,
        ..
    } = Settings::new(&opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    if let Err(err) = run(opt.command, registry_settings) {
        error!("{:#}", err);
        process::exit(1);
    }
}

fn run(command: Command, settings: RegistrySettings) -> anyhow::Result<()> {
    crypto::init()?;
    match command {
        Command::Keygen => {
            if settings.signing_key.exists() {
                return Err(anyhow!(
                    "refusing to overwrite {}",
                    settings.signing_key.display()
                ));
            }
            let keys = SigningKeyPair::generate();
            fs::write(&settings.signing_key, keys.secret.to_hex())
                .with_context(|| format!("writing {}", settings.signing_key.display()))?;
            println!("{}", keys.public.to_hex());
        }
        Command::Bootstrap { parameters } => {
            let json = fs::read_to_string(&parameters)
                .with_context(|| format!("reading {}", parameters.display()))?;
            let parameters: Vec<f32> = serde_json::from_str(&json)?;
            let package = open_registry(&settings)?.bootstrap(parameters)?;
            println!("{} {}", package.version, package.fingerprint());
        }
        Command::Export { version, out } => {
            let registry = open_registry(&settings)?;
            let package = match version {
                Some(version) => registry.get(version)?,
                None => registry.get_active()?,
            };
            package.export(&out)?;
            info!("exported version {} to {}", package.version, out.display());
        }
        Command::Verify {
            package,
            public_key,
        } => {
            let public_key = PublicSigningKey::from_hex(&public_key)
                .ok_or_else(|| anyhow!("invalid public key"))?;
            let package = SignedPackage::import(&package)?;
            if !package.verify(&public_key) {
                return Err(anyhow!(
                    "signature of version {} does not verify",
                    package.version
                ));
            }
            println!(
                "version {} schema {} ok",
                package.version, package.schema_version
            );
        }
        Command::Rollback { target } => {
            let package = open_registry(&settings)?.rollback(target)?;
            println!("{} {}", package.version, package.fingerprint());
        }
        Command::Status => {
            let registry = open_registry(&settings)?;
            let active = registry.active_version();
            for version in registry.versions() {
                let package = registry.get(version)?;
                println!(
                    "{}{} {} {}",
                    if Some(version) == active { "*" } else { " " },
                    version,
                    package.created_at,
                    package.fingerprint()
                );
            }
        }
    }
    Ok(())
}

fn open_registry(settings: &RegistrySettings) -> anyhow::Result<ModelRegistry<FileStore>> {
    let hex = fs::read_to_string(&settings.signing_key)
        .with_context(|| format!("reading {}", settings.signing_key.display()))?;
    let secret = SecretSigningKey::from_hex(&hex).ok_or_else(|| anyhow!("invalid signing key"))?;
    let storage = FileStore::open(&settings.path)?;
    let registry = ModelRegistry::open(
        storage,
        SigningKeyPair::from_secret(secret),
        settings.schema_version.clone(),
        Arc::new(SystemClock),
    )?;
    Ok(registry)
}

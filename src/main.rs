use std::io::Write;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use k8s_openapi::api::core::v1::LimitRange;
use kube::ResourceExt;
use tracing::info;

use vmi_mutator::config::ClusterConfig;
use vmi_mutator::manifests::{read_manifest, read_manifests};
use vmi_mutator::mutators::vmi::{self, limits::namespace_limit_ranges, presets::matching_presets};
use vmi_mutator::mutators::{Arch, Context, Operation};
use vmi_mutator::resources::virtualmachineinstancepresets::VirtualMachineInstancePreset;
use vmi_mutator::resources::virtualmachineinstances::VirtualMachineInstance;
use vmi_mutator::telemetry::{self, LogFormat};

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

/// Apply admission defaults to a VirtualMachineInstance manifest and print the result.
#[derive(Debug, clap::Parser)]
#[command(version)]
struct Arguments {
    /// Manifest of the VirtualMachineInstance being admitted
    #[arg(value_name = "FILE")]
    object: PathBuf,

    /// Manifest of the stored VirtualMachineInstance, required for updates
    #[arg(long, value_name = "FILE")]
    old_object: Option<PathBuf>,

    #[arg(long, default_value = "CREATE")]
    operation: Operation,

    /// Identity of the user submitting the request
    #[arg(long, env = "VMI_MUTATOR_USER", default_value = "")]
    user: String,

    /// Cluster configuration file
    #[arg(long, env = "VMI_MUTATOR_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Manifest with VirtualMachineInstancePresets
    #[arg(long, value_name = "FILE")]
    presets: Option<PathBuf>,

    /// Manifest with LimitRanges
    #[arg(long, value_name = "FILE")]
    limit_ranges: Option<PathBuf>,

    /// Architecture of the virtualization nodes, defaults to the local one
    #[arg(long, env = "VMI_MUTATOR_ARCH")]
    arch: Option<Arch>,

    #[arg(long, value_enum, default_value_t)]
    output: OutputFormat,

    #[arg(long, value_enum, default_value_t)]
    log_format: LogFormat,
}

fn load_all<T: serde::de::DeserializeOwned>(path: Option<&PathBuf>) -> anyhow::Result<Vec<T>> {
    match path {
        Some(path) => read_manifests(path).with_context(|| format!("reading {}", path.display())),
        None => Ok(vec![]),
    }
}

fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();
    telemetry::init(args.log_format);

    let config = match &args.config {
        Some(path) => ClusterConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => ClusterConfig::default(),
    };
    let arch = match args.arch {
        Some(arch) => arch,
        None => Arch::host().context("unsupported local architecture, pass --arch")?,
    };

    let new: VirtualMachineInstance = read_manifest(&args.object)
        .with_context(|| format!("reading {}", args.object.display()))?;
    let old: Option<VirtualMachineInstance> = match &args.old_object {
        Some(path) => Some(
            read_manifest(path).with_context(|| format!("reading {}", path.display()))?,
        ),
        None => None,
    };

    let presets: Vec<VirtualMachineInstancePreset> = load_all(args.presets.as_ref())?;
    let presets = matching_presets(&new, &presets);
    let limit_ranges: Vec<LimitRange> = load_all(args.limit_ranges.as_ref())?;
    let namespace = new.namespace();
    let limit_ranges: Vec<LimitRange> = namespace_limit_ranges(&limit_ranges, namespace.as_deref())
        .into_iter()
        .cloned()
        .collect();

    info!(
        vmi = %new.name_any(),
        operation = %args.operation,
        %arch,
        presets = presets.len(),
        limit_ranges = limit_ranges.len(),
        "Admitting VMI"
    );
    let ctx = Context {
        config: &config,
        arch,
        presets: &presets,
        limit_ranges: &limit_ranges,
    };
    let mutation = vmi::mutate(args.operation, old.as_ref(), new, &args.user, &ctx)
        .context("VMI rejected")?;

    let rendered = match args.output {
        OutputFormat::Yaml => serde_yaml::to_string(&mutation.vmi)?,
        OutputFormat::Json => serde_json::to_string_pretty(&mutation.vmi)? + "\n",
    };
    std::io::stdout().write_all(rendered.as_bytes())?;
    Ok(())
}

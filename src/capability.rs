use std::process::Command;
use std::sync::OnceLock;

use crate::error::CapabilityError;

/// How a capability is detected
#[derive(Debug, Clone)]
pub enum Probe {
    /// Executable that must run successfully with the given arguments
    Executable {
        program: &'static str,
        args: &'static [&'static str],
    },
    /// Decided at compile time, typically from `cfg!(feature = ...)`
    Feature(bool),
}

impl Probe {
    fn run(&self) -> bool {
        match self {
            Probe::Executable { program, args } => Command::new(program)
                .args(*args)
                .output()
                .map(|out| out.status.success())
                .unwrap_or(false),
            Probe::Feature(enabled) => *enabled,
        }
    }
}

#[derive(Debug)]
pub struct Capability {
    pub name: &'static str,
    pub probe: Probe,
    /// Shown to the user when the capability is missing
    pub remediation: &'static str,
    status: OnceLock<bool>,
}

impl Capability {
    pub fn new(name: &'static str, probe: Probe, remediation: &'static str) -> Self {
        Self {
            name,
            probe,
            remediation,
            status: OnceLock::new(),
        }
    }

    /// Probe result, computed on first call and cached afterwards
    pub fn is_available(&self) -> bool {
        *self.status.get_or_init(|| {
            let available = self.probe.run();
            tracing::debug!("Capability {} available: {}", self.name, available);
            available
        })
    }
}

/// Optional capabilities, each probed at most once
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: Vec<Capability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the capabilities this crate knows about
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Capability::new(
            "wgpu",
            Probe::Feature(cfg!(feature = "wgpu")),
            "rebuild with `--features wgpu` to enable GPU training",
        ));
        registry.register(Capability::new(
            "nvidia-smi",
            Probe::Executable {
                program: "nvidia-smi",
                args: &["--query-gpu=name", "--format=csv,noheader"],
            },
            "install the NVIDIA driver utilities and make sure `nvidia-smi` is on PATH",
        ));
        registry
    }

    /// Add a capability, replacing any previous one with the same name
    pub fn register(&mut self, capability: Capability) {
        self.capabilities.retain(|c| c.name != capability.name);
        self.capabilities.push(capability);
    }

    /// Probe every registered capability. Results are cached, so calling this
    /// again is cheap.
    pub fn probe_all(&self) -> Vec<(&'static str, bool)> {
        self.capabilities
            .iter()
            .map(|c| (c.name, c.is_available()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.get(name).is_some_and(Capability::is_available)
    }

    /// Ok when the capability is present, otherwise an error carrying the
    /// remediation message.
    pub fn require(&self, name: &str) -> Result<(), CapabilityError> {
        let capability = self
            .get(name)
            .ok_or_else(|| CapabilityError::Unknown(name.to_string()))?;

        if capability.is_available() {
            Ok(())
        } else {
            Err(CapabilityError::Unavailable {
                name: capability.name.to_string(),
                remediation: capability.remediation.to_string(),
            })
        }
    }

    /// Live GPU stats, only when `nvidia-smi` is available
    pub fn gpu_info(&self) -> Result<Option<GpuInfo>, CapabilityError> {
        self.require("nvidia-smi")?;
        Ok(query_nvidia_smi())
    }
}

/// GPU information collected via nvidia-smi
#[derive(Debug, Clone, PartialEq)]
pub struct GpuInfo {
    pub name: String,
    pub vram_total_mb: u64,
    pub vram_used_mb: u64,
    pub utilization_percent: f32,
    pub temperature_c: f32,
}

fn query_nvidia_smi() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.used,utilization.gpu,temperature.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    parse_gpu_line(String::from_utf8_lossy(&output.stdout).lines().next()?)
}

/// Parse one CSV line of the nvidia-smi query above
fn parse_gpu_line(line: &str) -> Option<GpuInfo> {
    let parts: Vec<&str> = line.trim().split(',').map(|s| s.trim()).collect();
    if parts.len() < 5 {
        return None;
    }

    Some(GpuInfo {
        name: parts[0].to_string(),
        vram_total_mb: parts[1].parse().unwrap_or(0),
        vram_used_mb: parts[2].parse().unwrap_or(0),
        utilization_percent: parts[3].parse().unwrap_or(0.0),
        temperature_c: parts[4].parse().unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(Capability::new("present", Probe::Feature(true), "nothing to do"));
        registry.register(Capability::new(
            "absent",
            Probe::Feature(false),
            "enable the absent feature",
        ));
        registry.register(Capability::new(
            "missing-tool",
            Probe::Executable {
                program: "definitely-not-an-installed-tool-4821",
                args: &[],
            },
            "install missing-tool",
        ));
        registry
    }

    #[test]
    fn test_available_capability_is_ok() {
        let registry = registry();
        assert!(registry.require("present").is_ok());
        assert!(registry.is_available("present"));
    }

    #[test]
    fn test_unavailable_capability_carries_remediation() {
        let registry = registry();
        let err = registry.require("absent").unwrap_err();
        assert!(matches!(err, CapabilityError::Unavailable { .. }));
        assert!(err.to_string().contains("enable the absent feature"));

        let err = registry.require("missing-tool").unwrap_err();
        assert!(err.to_string().contains("install missing-tool"));
    }

    #[test]
    fn test_unknown_capability() {
        let registry = registry();
        assert!(matches!(
            registry.require("quantum"),
            Err(CapabilityError::Unknown(name)) if name == "quantum"
        ));
        assert!(!registry.is_available("quantum"));
    }

    #[test]
    fn test_probe_all_reports_every_capability() {
        let registry = registry();
        let results = registry.probe_all();
        assert_eq!(
            results,
            vec![("present", true), ("absent", false), ("missing-tool", false)]
        );
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = registry();
        registry.register(Capability::new("absent", Probe::Feature(true), "now present"));
        assert!(registry.require("absent").is_ok());
        assert_eq!(registry.probe_all().len(), 3);
    }

    #[test]
    fn test_defaults_track_wgpu_feature() {
        let registry = CapabilityRegistry::with_defaults();
        assert_eq!(registry.is_available("wgpu"), cfg!(feature = "wgpu"));
        assert!(registry.get("nvidia-smi").is_some());
    }

    #[test]
    fn test_parse_gpu_line() {
        let info = parse_gpu_line("NVIDIA GeForce RTX 3090, 24576, 1024, 37, 55").unwrap();
        assert_eq!(info.name, "NVIDIA GeForce RTX 3090");
        assert_eq!(info.vram_total_mb, 24576);
        assert_eq!(info.vram_used_mb, 1024);
        assert_eq!(info.utilization_percent, 37.0);
        assert!(parse_gpu_line("broken,line").is_none());
    }
}

use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::licensing::types::HardwareIdentity;

/// Vendor-template values that firmware ships when no real serial was burned in
const PLACEHOLDER_VALUES: &[&str] = &[
    "to be filled by o.e.m.",
    "default string",
    "system serial number",
    "not specified",
    "not applicable",
    "none",
    "n/a",
    "unknown",
    "0123456789",
    "123456789",
];

/// One platform-specific source of a hardware serial
pub trait IdentityProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw value from the platform, before plausibility filtering
    fn probe(&self) -> Option<String>;
}

/// Strip NULs and whitespace and reject vendor placeholders
pub fn plausible(raw: &str) -> Option<String> {
    let value = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if value.is_empty() {
        return None;
    }

    let lowered = value.to_ascii_lowercase();
    if PLACEHOLDER_VALUES.contains(&lowered.as_str()) {
        return None;
    }
    if value.chars().all(|c| c == '0' || c == '-' || c == ':') {
        return None;
    }

    Some(value.to_string())
}

/// Reads the first existing file from a list of candidates
pub struct FileProbe {
    name: &'static str,
    paths: Vec<PathBuf>,
}

impl FileProbe {
    pub fn new(name: &'static str, paths: Vec<PathBuf>) -> Self {
        Self { name, paths }
    }

    /// Serial burned into the device tree (ARM boards)
    pub fn device_tree_serial() -> Self {
        Self::new(
            "device-tree",
            vec![
                PathBuf::from("/proc/device-tree/serial-number"),
                PathBuf::from("/sys/firmware/devicetree/base/serial-number"),
            ],
        )
    }

    /// SMBIOS inventory fields exposed by the kernel (x86 boxes)
    pub fn firmware_inventory() -> Self {
        Self::new(
            "dmi",
            vec![
                PathBuf::from("/sys/class/dmi/id/product_serial"),
                PathBuf::from("/sys/class/dmi/id/product_uuid"),
                PathBuf::from("/sys/class/dmi/id/board_serial"),
            ],
        )
    }
}

impl IdentityProbe for FileProbe {
    fn name(&self) -> &'static str {
        self.name
    }

    fn probe(&self) -> Option<String> {
        self.paths.iter().find_map(|path| {
            let bytes = std::fs::read(path).ok()?;
            plausible(&String::from_utf8_lossy(&bytes))
        })
    }
}

/// `Serial` line of /proc/cpuinfo
pub struct CpuInfoSerialProbe {
    path: PathBuf,
}

impl CpuInfoSerialProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for CpuInfoSerialProbe {
    fn default() -> Self {
        Self::new("/proc/cpuinfo")
    }
}

impl IdentityProbe for CpuInfoSerialProbe {
    fn name(&self) -> &'static str {
        "cpuinfo"
    }

    fn probe(&self) -> Option<String> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        contents.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("serial") {
                plausible(value)
            } else {
                None
            }
        })
    }
}

/// Last resort: hashed processor identifier
#[cfg(not(any(target_os = "ios", target_os = "android")))]
pub struct ProcessorIdProbe;

#[cfg(not(any(target_os = "ios", target_os = "android")))]
impl IdentityProbe for ProcessorIdProbe {
    fn name(&self) -> &'static str {
        "processor"
    }

    fn probe(&self) -> Option<String> {
        use machineid_rs::{Encryption, HWIDComponent, IdBuilder};

        match IdBuilder::new(Encryption::SHA256)
            .add_component(HWIDComponent::CPUID)
            .build("vendo-entitlement")
        {
            Ok(id) => plausible(&id),
            Err(e) => {
                debug!(error = %e, "processor id unavailable");
                None
            }
        }
    }
}

/// Resolves and caches the hardware identity for the process lifetime
pub struct IdentityResolver {
    probes: Vec<Box<dyn IdentityProbe>>,
    cached: RwLock<Option<HardwareIdentity>>,
}

impl IdentityResolver {
    pub fn with_probes(probes: Vec<Box<dyn IdentityProbe>>) -> Self {
        Self {
            probes,
            cached: RwLock::new(None),
        }
    }

    /// Probe order used on the appliance
    pub fn platform_default() -> Self {
        let mut probes: Vec<Box<dyn IdentityProbe>> = vec![
            Box::new(FileProbe::device_tree_serial()),
            Box::new(CpuInfoSerialProbe::default()),
            Box::new(FileProbe::firmware_inventory()),
        ];
        #[cfg(not(any(target_os = "ios", target_os = "android")))]
        probes.push(Box::new(ProcessorIdProbe));

        Self::with_probes(probes)
    }

    /// Returns the cached identity, re-probing only while it is unknown
    pub fn resolve(&self) -> HardwareIdentity {
        if let Some(identity) = self
            .cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            if !identity.is_unknown() {
                return identity.clone();
            }
        }

        let identity = self.probe_all();
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(identity.clone());
        identity
    }

    fn probe_all(&self) -> HardwareIdentity {
        for probe in &self.probes {
            if let Some(value) = probe.probe().as_deref().and_then(plausible) {
                info!(probe = probe.name(), identity = %value, "hardware identity resolved");
                return HardwareIdentity::new(value);
            }
            debug!(probe = probe.name(), "identity probe produced nothing");
        }

        warn!("no identity probe succeeded");
        HardwareIdentity::unknown()
    }
}

#[cfg(test)]
pub(crate) struct StaticProbe(pub Option<&'static str>);

#[cfg(test)]
impl IdentityProbe for StaticProbe {
    fn name(&self) -> &'static str {
        "static"
    }

    fn probe(&self) -> Option<String> {
        self.0.map(str::to_string)
    }
}

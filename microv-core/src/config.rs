//! Boot configuration
//!
//! Parses the firmware command line and holds the resulting knobs for the
//! rest of boot. Recognized flags:
//!
//! • `--enable-winpv` / `--disable-winpv` — Windows PV drivers (default on)
//! • `--disable-xen-pfd` — hide the Xen platform PCI device
//! • `--enable-xue` — USB3 debugger
//! • `--no-pci-pt BB:DD.F` — blacklist a PCI function from passthrough
//!
//! The parsed configuration is published once at early boot and never
//! re-initialized.

extern crate alloc;

use alloc::boxed::Box;
use heapless::Vec as FixedVec;
use once_cell::race::OnceBox;

/// Maximum number of blacklisted PCI functions.
pub const NO_PCI_PT_LIST_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct BootConfig {
    pub enable_winpv: bool,
    pub disable_xen_pfd: bool,
    pub enable_xue: bool,
    /// Packed `(bus << 16) | (dev << 11) | (fun << 8)` entries.
    pub no_pci_pt: FixedVec<u32, NO_PCI_PT_LIST_SIZE>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            enable_winpv: true,
            disable_xen_pfd: false,
            enable_xue: false,
            no_pci_pt: FixedVec::new(),
        }
    }
}

impl BootConfig {
    /// Parse the firmware command line. Malformed arguments are skipped
    /// with a log line, never fatal.
    pub fn parse<'a>(args: impl Iterator<Item = &'a str>) -> Self {
        let mut cfg = Self::default();
        let mut iter = args;

        while let Some(arg) = iter.next() {
            match arg {
                "--enable-winpv" => cfg.enable_winpv = true,
                "--disable-winpv" => cfg.enable_winpv = false,
                "--disable-xen-pfd" => cfg.disable_xen_pfd = true,
                "--enable-xue" => cfg.enable_xue = true,
                "--no-pci-pt" => {
                    let Some(bdf_str) = iter.next() else {
                        continue;
                    };
                    match parse_bdf(bdf_str) {
                        Some(packed) => {
                            if cfg.no_pci_pt.push(packed).is_err() {
                                crate::log!("no-pci-pt list full, ignoring {}", bdf_str);
                            }
                        }
                        None => {
                            crate::log!("invalid BDF string: {} (usage: --no-pci-pt BB:DD.F)", bdf_str);
                        }
                    }
                }
                _ => {}
            }
        }

        cfg
    }

    /// True when passthrough of the function at `(bus, dev, fun)` was
    /// disabled on the command line.
    pub fn pci_pt_denied(&self, bus: u32, dev: u32, fun: u32) -> bool {
        let packed = (bus << 16) | (dev << 11) | (fun << 8);
        self.no_pci_pt.iter().any(|&e| e == packed)
    }
}

/// Parse a strict 7-character `BB:DD.F` hex triple into the packed form.
fn parse_bdf(s: &str) -> Option<u32> {
    let bytes = s.as_bytes();
    if bytes.len() != 7 || bytes[2] != b':' || bytes[5] != b'.' {
        return None;
    }

    let bus = u32::from_str_radix(s.get(0..2)?, 16).ok()?;
    let dev = u32::from_str_radix(s.get(3..5)?, 16).ok()?;
    let fun = u32::from_str_radix(s.get(6..7)?, 16).ok()?;

    if bus > 255 || dev > 31 || fun > 7 {
        return None;
    }

    Some((bus << 16) | (dev << 11) | (fun << 8))
}

static BOOT_CONFIG: OnceBox<BootConfig> = OnceBox::new();

/// Publish the parsed configuration; returns false if already initialized.
pub fn init(cfg: BootConfig) -> bool {
    BOOT_CONFIG.set(Box::new(cfg)).is_ok()
}

/// The boot configuration, defaults before `init` runs.
pub fn get() -> &'static BootConfig {
    BOOT_CONFIG.get_or_init(|| Box::new(BootConfig::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_winpv() {
        let cfg = BootConfig::parse([].into_iter());
        assert!(cfg.enable_winpv);
        assert!(!cfg.disable_xen_pfd);
        assert!(!cfg.enable_xue);
        assert!(cfg.no_pci_pt.is_empty());
    }

    #[test]
    fn flags_toggle() {
        let cfg = BootConfig::parse(
            ["--disable-winpv", "--disable-xen-pfd", "--enable-xue"].into_iter(),
        );
        assert!(!cfg.enable_winpv);
        assert!(cfg.disable_xen_pfd);
        assert!(cfg.enable_xue);
    }

    #[test]
    fn bdf_packs_like_config_address() {
        let cfg = BootConfig::parse(["--no-pci-pt", "3a:1f.7"].into_iter());
        assert_eq!(cfg.no_pci_pt.len(), 1);
        assert_eq!(cfg.no_pci_pt[0], (0x3A << 16) | (0x1F << 11) | (0x7 << 8));
        assert!(cfg.pci_pt_denied(0x3A, 0x1F, 0x7));
        assert!(!cfg.pci_pt_denied(0x3A, 0x1F, 0x6));
    }

    #[test]
    fn bdf_must_be_exactly_seven_chars() {
        assert_eq!(parse_bdf("3a:1f.7 "), None);
        assert_eq!(parse_bdf("3a:1f"), None);
        assert_eq!(parse_bdf("3a-1f.7"), None);
        assert_eq!(parse_bdf("zz:1f.7"), None);
    }

    #[test]
    fn bdf_range_checked() {
        // dev > 31 and fun > 7 must be rejected even when they parse as hex
        assert_eq!(parse_bdf("00:20.0"), None);
        assert_eq!(parse_bdf("00:1f.8"), None);
        assert!(parse_bdf("ff:1f.7").is_some());
    }

    #[test]
    fn missing_bdf_argument_is_skipped() {
        let cfg = BootConfig::parse(["--no-pci-pt"].into_iter());
        assert!(cfg.no_pci_pt.is_empty());
    }
}

//! XENVER information surface
//!
//! Front-end drivers probe these before doing anything else; the values
//! describe the interface the shim emulates, not a real Xen build.

/// Compatible interface version reported to guests.
const XEN_MAJOR: u32 = 4;
const XEN_MINOR: u32 = 13;

/// XEN_VERSION_* subops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XenVerOp {
    Version,
    ExtraVersion,
    CompileInfo,
    Capabilities,
    Changeset,
    PlatformParameters,
    GetFeatures,
    PageSize,
    GuestHandle,
    CommandLine,
    BuildId,
}

impl XenVerOp {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Version),
            1 => Some(Self::ExtraVersion),
            2 => Some(Self::CompileInfo),
            3 => Some(Self::Capabilities),
            4 => Some(Self::Changeset),
            5 => Some(Self::PlatformParameters),
            6 => Some(Self::GetFeatures),
            7 => Some(Self::PageSize),
            8 => Some(Self::GuestHandle),
            9 => Some(Self::CommandLine),
            10 => Some(Self::BuildId),
            _ => None,
        }
    }
}

pub struct XenVer {
    guest_handle: u64,
}

impl XenVer {
    pub fn new() -> Self {
        Self { guest_handle: 0 }
    }

    /// `(major << 16) | minor`
    pub fn version(&self) -> u32 {
        (XEN_MAJOR << 16) | XEN_MINOR
    }

    pub fn extraversion(&self) -> &'static str {
        "-microv"
    }

    pub fn compile_info(&self) -> &'static str {
        "microv virtual xen"
    }

    pub fn capabilities(&self) -> &'static str {
        "hvm-3.0-x86_64"
    }

    pub fn changeset(&self) -> &'static str {
        ""
    }

    /// Virtual start of the hypervisor hole; HVM guests get zero.
    pub fn platform_parameters(&self) -> u64 {
        0
    }

    /// Feature bitmap for submap 0: hvm_callback_vector and
    /// hvm_safe_pvclock.
    pub fn get_features(&self, submap: u32) -> u32 {
        if submap == 0 {
            (1 << 8) | (1 << 9)
        } else {
            0
        }
    }

    pub fn pagesize(&self) -> u32 {
        4096
    }

    pub fn guest_handle(&self) -> u64 {
        self.guest_handle
    }

    pub fn set_guest_handle(&mut self, handle: u64) {
        self.guest_handle = handle;
    }

    pub fn commandline(&self) -> &'static str {
        ""
    }

    pub fn build_id(&self) -> &'static str {
        ""
    }
}

impl Default for XenVer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_packs_major_minor() {
        let ver = XenVer::new();
        assert_eq!(ver.version(), (4 << 16) | 13);
        assert_eq!(ver.pagesize(), 4096);
    }

    #[test]
    fn features_only_in_submap_zero() {
        let ver = XenVer::new();
        assert_ne!(ver.get_features(0), 0);
        assert_eq!(ver.get_features(1), 0);
    }

    #[test]
    fn subop_decoding() {
        assert_eq!(XenVerOp::from_raw(0), Some(XenVerOp::Version));
        assert_eq!(XenVerOp::from_raw(7), Some(XenVerOp::PageSize));
        assert_eq!(XenVerOp::from_raw(42), None);
    }
}

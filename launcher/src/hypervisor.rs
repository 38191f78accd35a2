use serde::Deserialize;

/// Process-name prefixes of every VMM binary the launcher may run.
pub const VMM_PROCESS_PREFIXES: &[&str] = &["qemu-system", "qemu-kvm", "cloud-hypervisor"];

/// Which hypervisor driver backs the domain.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorKind {
    #[default]
    Qemu,
    #[serde(rename = "ch")]
    CloudHypervisor,
}

impl HypervisorKind {
    /// Modular libvirt daemon managing this driver.
    pub fn daemon_name(self) -> &'static str {
        match self {
            HypervisorKind::Qemu => "virtqemud",
            HypervisorKind::CloudHypervisor => "virtchd",
        }
    }

    /// Driver name as used in libvirt's runtime and log directories.
    pub fn vmm(self) -> &'static str {
        match self {
            HypervisorKind::Qemu => "qemu",
            HypervisorKind::CloudHypervisor => "ch",
        }
    }

    /// Read-write socket of the daemon.
    pub fn libvirt_socket_path(self) -> String {
        format!("/var/run/libvirt/{}-sock", self.daemon_name())
    }

    /// Connection URI for the daemon's system instance.
    pub fn connection_uri(self) -> String {
        format!("{}:///system", self.vmm())
    }

    /// Process-name prefixes identifying this driver's VMM.
    pub fn vmm_process_prefixes(self) -> &'static [&'static str] {
        match self {
            HypervisorKind::Qemu => &VMM_PROCESS_PREFIXES[..2],
            HypervisorKind::CloudHypervisor => &VMM_PROCESS_PREFIXES[2..],
        }
    }
}

impl std::fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.vmm())
    }
}

//! Platform identifiers, operating systems and CPU architectures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Trailing identifier segment that selects a 64-bit ARM leg (`macos-14-arm64`, `ubuntu-24.04-arm`).
static ARM_SUFFIX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)[-_](arm64|aarch64|arm)$").expect("static regex is valid")
});

/// Characters allowed in an identifier; it ends up as a directory and archive name.
static VALID_ID: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex is valid")
});

/// Operating system a leg targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Macos,
    Windows,
}

impl Os {
    /// Operating system of the running binary.
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            Os::Windows
        } else if cfg!(target_os = "macos") {
            Os::Macos
        } else {
            Os::Linux
        }
    }

    /// Parses a user-facing OS name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "linux" | "ubuntu" => Some(Os::Linux),
            "macos" | "darwin" | "osx" => Some(Os::Macos),
            "windows" | "win" => Some(Os::Windows),
            _ => None,
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Os::Linux => "linux",
            Os::Macos => "macos",
            Os::Windows => "windows",
        })
    }
}

/// CPU architecture a leg targets.
///
/// `X86_64` is the primary architecture for emulation gating: hosted Linux x86_64 legs
/// register foreign-architecture handlers so the build can run aarch64 containers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// x86_64 / AMD64 (64-bit)
    X86_64,
    /// x86 / i686 (32-bit)
    X86,
    /// AArch64 / ARM64 (64-bit)
    AArch64,
    /// ARM with hard-float (32-bit)
    Armhf,
    /// RISC-V (64-bit)
    Riscv64,
}

impl Arch {
    /// Architecture of the running binary.
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "x86" => Arch::X86,
            "aarch64" => Arch::AArch64,
            "arm" => Arch::Armhf,
            "riscv64" => Arch::Riscv64,
            _ => Arch::X86_64,
        }
    }

    /// Parses common architecture spellings (`amd64`, `arm64`, `i686`, ...).
    ///
    /// A bare `arm` means AArch64, matching the `-arm` identifier suffix of hosted runners;
    /// 32-bit ARM must be spelled `armhf` or `armv7`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Some(Arch::X86_64),
            "x86" | "i686" | "i386" => Some(Arch::X86),
            "aarch64" | "arm64" | "arm" => Some(Arch::AArch64),
            "armhf" | "armv7" => Some(Arch::Armhf),
            "riscv64" => Some(Arch::Riscv64),
            _ => None,
        }
    }

    /// Name used by `docker run --platform linux/<name>`.
    pub fn docker_name(&self) -> &'static str {
        match self {
            Arch::X86_64 => "amd64",
            Arch::X86 => "386",
            Arch::AArch64 => "arm64",
            Arch::Armhf => "arm/v7",
            Arch::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arch::X86_64 => "x86_64",
            Arch::X86 => "x86",
            Arch::AArch64 => "aarch64",
            Arch::Armhf => "armhf",
            Arch::Riscv64 => "riscv64",
        })
    }
}

/// Where a leg's build command executes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Runner {
    /// Directly on the host.
    Native,
    /// Inside `docker run` with the working tree mounted at `/workspace`.
    Container { image: String },
}

/// One entry of the build matrix.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Platform {
    pub id: String,
    pub os: Os,
    pub arch: Arch,
    pub runner: Runner,
}

impl Platform {
    /// Builds a native platform, inferring OS and architecture from the identifier.
    ///
    /// `ubuntu-latest` → Linux, `windows-2019` → Windows, `macos-14-arm64` → macOS/AArch64.
    /// Unknown prefixes fall back to the host OS, missing architecture suffixes to the host
    /// architecture.
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        let os = infer_os(&id).unwrap_or_else(Os::host);
        let arch = infer_arch(&id).unwrap_or_else(Arch::host);
        Self {
            id,
            os,
            arch,
            runner: Runner::Native,
        }
    }

    pub fn with_os(mut self, os: Os) -> Self {
        self.os = os;
        self
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_container(mut self, image: impl Into<String>) -> Self {
        self.runner = Runner::Container {
            image: image.into(),
        };
        self
    }

    /// Whether this leg's commands can be spawned on the current host.
    pub fn runs_on_host(&self) -> bool {
        match self.runner {
            Runner::Native => self.os == Os::host(),
            // Docker on non-Linux hosts runs a Linux VM
            Runner::Container { .. } => self.os == Os::Linux,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.id, self.os, self.arch)
    }
}

/// Checks that an identifier is usable as a directory and archive name.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("platform identifier cannot be empty".to_string());
    }
    if id == "." || id == ".." || !VALID_ID.is_match(id) {
        return Err(format!(
            "invalid platform identifier '{}': only letters, digits, '.', '_' and '-' are allowed",
            id
        ));
    }
    Ok(())
}

fn infer_os(id: &str) -> Option<Os> {
    let lower = id.to_ascii_lowercase();
    let head = lower.split(['-', '_']).next().unwrap_or_default();
    match head {
        "ubuntu" | "linux" | "manylinux" | "musllinux" | "debian" | "fedora" => Some(Os::Linux),
        "macos" | "darwin" | "osx" => Some(Os::Macos),
        "windows" | "win" => Some(Os::Windows),
        _ => None,
    }
}

fn infer_arch(id: &str) -> Option<Arch> {
    if ARM_SUFFIX.is_match(id) {
        return Some(Arch::AArch64);
    }
    let lower = id.to_ascii_lowercase();
    if lower.ends_with("x86_64") || lower.ends_with("amd64") || lower.ends_with("x64") {
        return Some(Arch::X86_64);
    }
    None
}

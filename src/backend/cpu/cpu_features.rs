//! Runtime CPU feature detection for choosing vector kernels
//!
//! Detection runs once (raw-cpuid on x86_64, compile-time knowledge on
//! aarch64) and is cached for the process.

use std::fmt;

use once_cell::sync::Lazy;
#[cfg(target_arch = "x86_64")]
use raw_cpuid::CpuId;

static CPU_FEATURES: Lazy<CpuFeatures> = Lazy::new(CpuFeatures::detect);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    /// 256-bit vectors, 8 f32 lanes
    pub avx2: bool,
    /// Fused multiply-add
    pub fma: bool,
    /// 128-bit vectors, 4 f32 lanes (mandatory on ARMv8)
    pub neon: bool,
    pub arch: CpuArch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86_64,
    Aarch64,
    Other,
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuArch::X86_64 => write!(f, "x86_64"),
            CpuArch::Aarch64 => write!(f, "aarch64"),
            CpuArch::Other => write!(f, "unknown"),
        }
    }
}

impl fmt::Display for CpuFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuFeatures({}", self.arch)?;
        if self.avx2 {
            write!(f, " +AVX2")?;
        }
        if self.fma {
            write!(f, " +FMA")?;
        }
        if self.neon {
            write!(f, " +NEON")?;
        }
        write!(f, ")")
    }
}

impl CpuFeatures {
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            let cpuid = CpuId::new();
            let avx2 = cpuid
                .get_extended_feature_info()
                .map(|info| info.has_avx2())
                .unwrap_or(false);
            let fma = cpuid
                .get_feature_info()
                .map(|info| info.has_fma())
                .unwrap_or(false);
            Self {
                avx2,
                fma,
                neon: false,
                arch: CpuArch::X86_64,
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            Self {
                avx2: false,
                fma: true,
                neon: true,
                arch: CpuArch::Aarch64,
            }
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            Self {
                avx2: false,
                fma: false,
                neon: false,
                arch: CpuArch::Other,
            }
        }
    }

    /// Cached result of [`CpuFeatures::detect`]
    #[inline]
    pub fn get() -> Self {
        *CPU_FEATURES
    }

    /// The vector kernels assume the native lane width (8 on x86_64, 4 on
    /// aarch64) is backed by hardware.
    pub fn supports_vector_kernels(&self) -> bool {
        match self.arch {
            CpuArch::X86_64 => self.avx2,
            CpuArch::Aarch64 => self.neon,
            CpuArch::Other => false,
        }
    }
}

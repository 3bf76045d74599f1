//! Auxiliary device actions.
//!
//! Small queries and commands multiplexed over a single request code, as
//! the runtime library issues them.

use crate::error::{NpuError, Result};

/// Driver version reported by [`Action::GetDrvVersion`].
pub const DRIVER_VERSION: (u32, u32, u32) = (0, 9, 8);

/// Encoded driver version: `major * 10000 + minor * 100 + patch`.
pub const fn driver_version_code() -> u32 {
    let (major, minor, patch) = DRIVER_VERSION;
    major * 10000 + minor * 100 + patch
}

/// Request codes understood by [`Action::from_code`].
pub mod code {
    /// Hardware version.
    pub const GET_HW_VERSION: u32 = 0;
    /// Driver version.
    pub const GET_DRV_VERSION: u32 = 1;
    /// Core clock frequency.
    pub const GET_FREQ: u32 = 2;
    /// Soft reset.
    pub const ACT_RESET: u32 = 6;
    /// IOMMU enabled flag.
    pub const GET_IOMMU_EN: u32 = 18;
    /// Caller nice value.
    pub const SET_PROC_NICE: u32 = 19;
    /// Take a command-line power reference.
    pub const POWER_ON: u32 = 20;
    /// Drop a command-line power reference.
    pub const POWER_OFF: u32 = 21;
    /// Total SRAM.
    pub const GET_TOTAL_SRAM_SIZE: u32 = 22;
    /// Free SRAM.
    pub const GET_FREE_SRAM_SIZE: u32 = 23;
    /// IOMMU domain id.
    pub const GET_IOMMU_DOMAIN_ID: u32 = 24;
    /// Select an IOMMU domain.
    pub const SET_IOMMU_DOMAIN_ID: u32 = 25;
}

/// An action request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Version word of core 0.
    GetHwVersion,
    /// Encoded driver version.
    GetDrvVersion,
    /// Core clock rate in Hz.
    GetFreq,
    /// Soft-reset the NPU.
    ActReset,
    /// 1 when the IOMMU is in use.
    GetIommuEn,
    /// Accepted and ignored.
    SetProcNice(i32),
    /// Always 0: no SRAM is managed.
    GetTotalSramSize,
    /// Always 0: no SRAM is managed.
    GetFreeSramSize,
    /// Always 0: a single domain.
    GetIommuDomainId,
    /// Accepted and ignored.
    SetIommuDomainId(u32),
    /// Take a command-line power reference.
    PowerOn,
    /// Drop a command-line power reference.
    PowerOff,
}

impl Action {
    /// Decode a request code and its argument.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidArgument`] for unknown codes.
    pub fn from_code(flags: u32, value: u32) -> Result<Self> {
        Ok(match flags {
            code::GET_HW_VERSION => Self::GetHwVersion,
            code::GET_DRV_VERSION => Self::GetDrvVersion,
            code::GET_FREQ => Self::GetFreq,
            code::ACT_RESET => Self::ActReset,
            code::GET_IOMMU_EN => Self::GetIommuEn,
            #[allow(clippy::cast_possible_wrap)]
            code::SET_PROC_NICE => Self::SetProcNice(value as i32),
            code::GET_TOTAL_SRAM_SIZE => Self::GetTotalSramSize,
            code::GET_FREE_SRAM_SIZE => Self::GetFreeSramSize,
            code::GET_IOMMU_DOMAIN_ID => Self::GetIommuDomainId,
            code::SET_IOMMU_DOMAIN_ID => Self::SetIommuDomainId(value),
            code::POWER_ON => Self::PowerOn,
            code::POWER_OFF => Self::PowerOff,
            other => return Err(NpuError::invalid_argument(format!("unknown action {other}"))),
        })
    }

    /// Request code.
    pub fn code(self) -> u32 {
        match self {
            Self::GetHwVersion => code::GET_HW_VERSION,
            Self::GetDrvVersion => code::GET_DRV_VERSION,
            Self::GetFreq => code::GET_FREQ,
            Self::ActReset => code::ACT_RESET,
            Self::GetIommuEn => code::GET_IOMMU_EN,
            Self::SetProcNice(_) => code::SET_PROC_NICE,
            Self::GetTotalSramSize => code::GET_TOTAL_SRAM_SIZE,
            Self::GetFreeSramSize => code::GET_FREE_SRAM_SIZE,
            Self::GetIommuDomainId => code::GET_IOMMU_DOMAIN_ID,
            Self::SetIommuDomainId(_) => code::SET_IOMMU_DOMAIN_ID,
            Self::PowerOn => code::POWER_ON,
            Self::PowerOff => code::POWER_OFF,
        }
    }

    /// Every query that has no side effect, in code order.
    pub const QUERIES: [Self; 7] = [
        Self::GetHwVersion,
        Self::GetDrvVersion,
        Self::GetFreq,
        Self::GetIommuEn,
        Self::GetTotalSramSize,
        Self::GetFreeSramSize,
        Self::GetIommuDomainId,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_code() {
        assert_eq!(driver_version_code(), 908);
    }

    #[test]
    fn codes_decode_to_themselves() {
        for c in [0, 1, 2, 6, 18, 19, 20, 21, 22, 23, 24, 25] {
            assert_eq!(Action::from_code(c, 0).unwrap().code(), c);
        }
    }

    #[test]
    fn unsupported_codes_rejected() {
        // 3..=5 and 7..=17 are frequency/volt/power-management codes not handled here
        for c in [3, 4, 5, 7, 17, 26, 0xffff] {
            assert!(matches!(
                Action::from_code(c, 0),
                Err(NpuError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn nice_value_is_signed() {
        assert_eq!(
            Action::from_code(code::SET_PROC_NICE, (-5i32) as u32).unwrap(),
            Action::SetProcNice(-5)
        );
    }
}

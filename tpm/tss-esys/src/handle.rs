// Copyright (c) Microsoft. All rights reserved.

use std::fmt;

use crate::types::{self, TpmHandle};

/// An application-visible resource identifier.
///
/// Values below [`EsysTr::MIN_OBJECT`] name well-known TPM entities. Everything
/// else is minted by an [`EsysContext`](crate::EsysContext) and is only meaningful to it.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EsysTr(pub(crate) u32);

impl EsysTr {
    pub const NONE: Self = Self(0xFFF);
    pub const PASSWORD: Self = Self(0x0FF);

    pub const PCR0: Self = Self(0);
    pub const PCR31: Self = Self(31);

    pub const RH_OWNER: Self = Self(0x101);
    pub const RH_NULL: Self = Self(0x107);
    pub const RH_LOCKOUT: Self = Self(0x10A);
    pub const RH_ENDORSEMENT: Self = Self(0x10B);
    pub const RH_PLATFORM: Self = Self(0x10C);
    pub const RH_PLATFORM_NV: Self = Self(0x10D);

    pub const MIN_OBJECT: u32 = 0x1000;

    #[must_use]
    pub const fn pcr(index: u8) -> Option<Self> {
        if index <= 31 {
            Some(Self(index as u32))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    pub(crate) const fn is_minted(self) -> bool {
        self.0 >= Self::MIN_OBJECT
    }

    /// The TPM handle behind a well-known identifier.
    pub(crate) fn well_known(self) -> Option<TpmHandle> {
        let handle = match self {
            Self::RH_OWNER => types::rh::OWNER,
            Self::RH_NULL => types::rh::NULL,
            Self::RH_LOCKOUT => types::rh::LOCKOUT,
            Self::RH_ENDORSEMENT => types::rh::ENDORSEMENT,
            Self::RH_PLATFORM => types::rh::PLATFORM,
            Self::RH_PLATFORM_NV => types::rh::PLATFORM_NV,
            Self::PASSWORD => types::rh::PW,
            Self(pcr) if pcr <= 31 => pcr,
            _ => return None,
        };
        Some(handle)
    }

    /// The well-known identifier for a permanent or PCR handle, if there is one.
    pub(crate) fn from_well_known(handle: TpmHandle) -> Option<Self> {
        let tr = match handle {
            types::rh::OWNER => Self::RH_OWNER,
            types::rh::NULL => Self::RH_NULL,
            types::rh::LOCKOUT => Self::RH_LOCKOUT,
            types::rh::ENDORSEMENT => Self::RH_ENDORSEMENT,
            types::rh::PLATFORM => Self::RH_PLATFORM,
            types::rh::PLATFORM_NV => Self::RH_PLATFORM_NV,
            pcr if pcr <= 31 => Self(pcr),
            _ => return None,
        };
        Some(tr)
    }
}

impl fmt::Debug for EsysTr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("EsysTr::NONE"),
            Self::PASSWORD => f.write_str("EsysTr::PASSWORD"),
            Self(value) => write!(f, "EsysTr(0x{value:X})"),
        }
    }
}

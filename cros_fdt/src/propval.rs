// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This module implements FDT property value conversions as defined by the device tree format.
//! All cells are big-endian.

use crate::fdt::c_str_to_string;
use crate::fdt::Error;
use crate::fdt::Result;
use crate::fdt::SIZE_U32;
use crate::fdt::SIZE_U64;

/// Conversion into an FDT property value.
///
/// Implementing `ToFdtPropval` for a type defines its conversion to a raw
/// FDT property value (a byte vector).
pub trait ToFdtPropval {
    // Convert the type to its byte representation as an FDT property.
    fn to_propval(self) -> Result<Vec<u8>>;
}

/// Conversion from an FDT property value.
///
/// Implementing `FromFdtPropval` for a type defines its construction from a raw
/// FDT property value (a byte slice).
pub trait FromFdtPropval {
    // Try to convert FDT property bytes to `Self`, return `None` if impossible.
    fn from_propval(propval: &[u8]) -> Option<Self>
    where
        Self: Sized;
}

macro_rules! cell_propval {
    ($ty:ty, $size:expr) => {
        impl ToFdtPropval for $ty {
            fn to_propval(self) -> Result<Vec<u8>> {
                Ok(self.to_be_bytes().to_vec())
            }
        }

        impl ToFdtPropval for &[$ty] {
            fn to_propval(self) -> Result<Vec<u8>> {
                Ok(self.iter().flat_map(|v| v.to_be_bytes()).collect())
            }
        }

        impl<const N: usize> ToFdtPropval for &[$ty; N] {
            fn to_propval(self) -> Result<Vec<u8>> {
                self.as_slice().to_propval()
            }
        }

        impl ToFdtPropval for Vec<$ty> {
            fn to_propval(self) -> Result<Vec<u8>> {
                self.as_slice().to_propval()
            }
        }

        impl FromFdtPropval for $ty {
            fn from_propval(propval: &[u8]) -> Option<Self> {
                propval.try_into().ok().map(<$ty>::from_be_bytes)
            }
        }

        impl FromFdtPropval for Vec<$ty> {
            fn from_propval(propval: &[u8]) -> Option<Self> {
                if propval.len() % $size != 0 {
                    return None;
                }
                propval
                    .chunks_exact($size)
                    .map(<$ty>::from_propval)
                    .collect()
            }
        }
    };
}

cell_propval!(u32, SIZE_U32);
cell_propval!(u64, SIZE_U64);

impl ToFdtPropval for () {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(vec![])
    }
}

impl ToFdtPropval for &[u8] {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(self.into())
    }
}

impl ToFdtPropval for Vec<u8> {
    fn to_propval(self) -> Result<Vec<u8>> {
        Ok(self)
    }
}

impl ToFdtPropval for &str {
    fn to_propval(self) -> Result<Vec<u8>> {
        // Neither libfdt nor the kernel devicetree API check for printable strings, only for
        // embedded NULs.
        if self.contains('\0') {
            return Err(Error::InvalidString(self.into()));
        }
        let mut bytes = Vec::with_capacity(self.len() + 1);
        bytes.extend_from_slice(self.as_bytes());
        bytes.push(0);
        Ok(bytes)
    }
}

impl FromFdtPropval for () {
    fn from_propval(propval: &[u8]) -> Option<Self> {
        propval.is_empty().then_some(())
    }
}

impl FromFdtPropval for Vec<u8> {
    fn from_propval(propval: &[u8]) -> Option<Self> {
        Some(propval.into())
    }
}

impl FromFdtPropval for String {
    fn from_propval(propval: &[u8]) -> Option<Self> {
        c_str_to_string(propval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fdt_as_propval() {
        assert_eq!(().to_propval().unwrap(), []);
        assert_eq!(0x12345678u32.to_propval().unwrap(), [0x12u8, 0x34, 0x56, 0x78]);
        assert_eq!(
            0x0002_0000_0000_0000u64.to_propval().unwrap(),
            [0x00u8, 0x02, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            [0x1u64, 0x10_0000_0000u64].to_propval().unwrap(),
            [0u8, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0x10, 0, 0, 0, 0]
        );
        assert_eq!("ibm,npu".to_propval().unwrap(), b"ibm,npu\0");
        "abc\0def".to_propval().expect_err("invalid string");
    }

    #[test]
    fn fdt_from_propval() {
        assert_eq!(u32::from_propval(&[0, 0, 0, 1]), Some(1u32));
        assert_eq!(
            u64::from_propval(&[0x00u8, 0x00, 0x12, 0x34, 0x56, 0x78, 0xAB, 0xCD]),
            Some(0x12345678ABCDu64)
        );
        assert_eq!(
            Vec::<u32>::from_propval(&[0, 0, 0, 1, 0, 0, 0xAB, 0xCD]),
            Some(vec![0x1u32, 0xABCD])
        );
        assert_eq!(
            Vec::<u64>::from_propval(&[0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0xAB, 0xCD, 0, 0, 0, 0]),
            Some(vec![0x1u64, 0xABCD00000000])
        );
        assert_eq!(
            String::from_propval(b"abc def\0"),
            Some("abc def".to_owned())
        );
        assert_eq!(Vec::<u64>::from_propval(&[]), Some(vec![]));

        assert!(String::from_propval(&[0x61u8, 0x62, 0x63]).is_none());
        assert!(u32::from_propval(&[0x61u8, 0x62]).is_none());
        assert!(u64::from_propval(&[0, 0, 0, 0, 0, 0, 0, 0, 0]).is_none());
        assert!(Vec::<u64>::from_propval(&[0; 12]).is_none());
    }
}

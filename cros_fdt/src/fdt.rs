// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Devicetree nodes, properties and phandle resolution, following the model described here:
//! <https://devicetree-specification.readthedocs.io/en/stable/devicetree-basics.html>

use indexmap::IndexMap;
use remain::sorted;
use thiserror::Error as ThisError;

use crate::propval::FromFdtPropval;
use crate::propval::ToFdtPropval;

#[sorted]
#[derive(ThisError, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid name string: {0}")]
    InvalidName(String),
    #[error("Invalid node path: {0}")]
    InvalidPath(String),
    #[error("Invalid string value {0}")]
    InvalidString(String),
    #[error("Property value size must fit in 32 bits")]
    PropertyValueTooLarge,
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) const SIZE_U32: usize = std::mem::size_of::<u32>();
pub(crate) const SIZE_U64: usize = std::mem::size_of::<u64>();

const PHANDLE_PROP: &str = "phandle";

// Node and property names: printable, no path separators.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && name.bytes().all(|b| b.is_ascii_graphic())
}

/// Extract a `String` from a NUL-terminated byte slice.
pub(crate) fn c_str_to_string(input: &[u8]) -> Option<String> {
    let (last, rest) = input.split_last()?;
    if *last != 0 || rest.contains(&0) {
        return None;
    }
    String::from_utf8(rest.to_vec()).ok()
}

/// A devicetree node with its properties and child nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FdtNode {
    name: String,
    props: IndexMap<String, Vec<u8>>,
    subnodes: IndexMap<String, FdtNode>,
}

impl FdtNode {
    fn new(name: &str) -> Self {
        FdtNode {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Name of this node; empty for the root node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the property `name` to `val`, replacing any previous value.
    pub fn set_prop<T>(&mut self, name: &str, val: T) -> Result<()>
    where
        T: ToFdtPropval,
    {
        if !is_valid_name(name) {
            return Err(Error::InvalidName(name.into()));
        }
        let bytes = val.to_propval()?;
        if u32::try_from(bytes.len()).is_err() {
            return Err(Error::PropertyValueTooLarge);
        }
        self.props.insert(name.into(), bytes);
        Ok(())
    }

    /// Remove the property `name`, returning its raw value if it was present.
    pub fn remove_prop(&mut self, name: &str) -> Option<Vec<u8>> {
        self.props.shift_remove(name)
    }

    /// Raw big-endian bytes of the property `name`.
    pub fn prop_bytes(&self, name: &str) -> Option<&[u8]> {
        self.props.get(name).map(Vec::as_slice)
    }

    /// Decode the property `name` as `T`.
    ///
    /// Returns `None` if the property is missing or its length does not match `T`.
    pub fn get_prop<T>(&self, name: &str) -> Option<T>
    where
        T: FromFdtPropval,
    {
        T::from_propval(self.prop_bytes(name)?)
    }

    /// Decode the `index`-th element of a property holding an array of `u64` cells.
    pub fn get_prop_u64_index(&self, name: &str, index: usize) -> Option<u64> {
        self.get_prop::<Vec<u64>>(name)?.get(index).copied()
    }

    /// Returns the phandle of this node, if it has one.
    pub fn phandle(&self) -> Option<u32> {
        self.get_prop(PHANDLE_PROP)
    }

    /// Returns the child node `name`, creating it if needed.
    pub fn subnode_mut(&mut self, name: &str) -> Result<&mut FdtNode> {
        if !is_valid_name(name) {
            return Err(Error::InvalidName(name.into()));
        }
        Ok(self
            .subnodes
            .entry(name.into())
            .or_insert_with(|| FdtNode::new(name)))
    }

    /// Returns the child node `name`.
    pub fn subnode(&self, name: &str) -> Option<&FdtNode> {
        self.subnodes.get(name)
    }

    /// Iterates over the direct children of this node.
    pub fn iter_subnodes(&self) -> impl Iterator<Item = &FdtNode> {
        self.subnodes.values()
    }

    fn find_phandle(&self, phandle: u32) -> Option<&FdtNode> {
        if self.phandle() == Some(phandle) {
            return Some(self);
        }
        self.iter_subnodes().find_map(|n| n.find_phandle(phandle))
    }
}

/// A devicetree rooted at `/`.
///
/// # Example
///
/// ```rust
/// use cros_fdt::Fdt;
///
/// # fn main() -> cros_fdt::Result<()> {
/// let mut fdt = Fdt::new();
/// let npu = fdt.node_mut("/pciex@620c3c0500000/npu@0")?;
/// npu.set_prop("ibm,device-tgt-addr", 0x4_0000_0000u64)?;
/// assert_eq!(
///     fdt.get_node("/pciex@620c3c0500000/npu@0")
///         .and_then(|n| n.get_prop::<u64>("ibm,device-tgt-addr")),
///     Some(0x4_0000_0000)
/// );
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fdt {
    root: FdtNode,
}

impl Fdt {
    /// Create an empty tree holding only the root node.
    pub fn new() -> Self {
        Fdt::default()
    }

    pub fn root(&self) -> &FdtNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut FdtNode {
        &mut self.root
    }

    fn split_path(path: &str) -> Result<impl Iterator<Item = &str>> {
        match path.strip_prefix('/') {
            Some(rest) => Ok(rest.split('/').filter(|c| !c.is_empty())),
            None => Err(Error::InvalidPath(path.into())),
        }
    }

    /// Look up a node by absolute path, e.g. `/soc/npu@0`.
    pub fn get_node(&self, path: &str) -> Option<&FdtNode> {
        Self::split_path(path)
            .ok()?
            .try_fold(&self.root, |node, name| node.subnode(name))
    }

    /// Returns the node at absolute `path`, creating missing nodes along the way.
    pub fn node_mut(&mut self, path: &str) -> Result<&mut FdtNode> {
        let mut node = &mut self.root;
        for name in Self::split_path(path)? {
            node = node.subnode_mut(name)?;
        }
        Ok(node)
    }

    /// Resolve a phandle reference to the node carrying it.
    pub fn node_by_phandle(&self, phandle: u32) -> Option<&FdtNode> {
        self.root.find_phandle(phandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_only() {
        let fdt = Fdt::new();
        assert_eq!(fdt.get_node("/"), Some(fdt.root()));
        assert_eq!(fdt.root().name(), "");
        assert!(fdt.get_node("/missing").is_none());
        assert!(fdt.get_node("relative").is_none());
    }

    #[test]
    fn nested_nodes() {
        let mut fdt = Fdt::new();
        fdt.node_mut("/a/b/c").unwrap().set_prop("val", 7u32).unwrap();
        assert_eq!(fdt.get_node("/a/b").unwrap().name(), "b");
        assert_eq!(fdt.get_node("/a/b/c").unwrap().get_prop::<u32>("val"), Some(7));
        // Trailing separators are ignored.
        assert_eq!(fdt.get_node("/a/b/c/").unwrap().name(), "c");
        assert_eq!(fdt.root().iter_subnodes().count(), 1);
    }

    #[test]
    fn invalid_names() {
        let mut fdt = Fdt::new();
        assert_eq!(
            fdt.node_mut("no-slash"),
            Err(Error::InvalidPath("no-slash".into()))
        );
        let node = fdt.node_mut("/ok").unwrap();
        assert_eq!(
            node.set_prop("bad name", 1u32),
            Err(Error::InvalidName("bad name".into()))
        );
        assert_eq!(node.set_prop("", 1u32), Err(Error::InvalidName("".into())));
    }

    #[test]
    fn replace_prop() {
        let mut fdt = Fdt::new();
        let node = fdt.node_mut("/n").unwrap();
        node.set_prop("reg", 1u64).unwrap();
        node.set_prop("reg", [2u64, 3u64].as_slice()).unwrap();
        assert_eq!(node.get_prop::<u64>("reg"), None);
        assert_eq!(node.get_prop::<Vec<u64>>("reg"), Some(vec![2, 3]));
        assert_eq!(node.prop_bytes("reg").map(|b| b.len()), Some(16));
        assert!(node.remove_prop("reg").is_some());
        assert!(node.remove_prop("reg").is_none());
        assert_eq!(node.get_prop::<Vec<u64>>("reg"), None);
    }

    #[test]
    fn u64_index() {
        let mut fdt = Fdt::new();
        let node = fdt.node_mut("/phb").unwrap();
        node.set_prop("ibm,mmio-atsd", [0x10u64, 0x20, 0x30].as_slice())
            .unwrap();
        assert_eq!(node.get_prop_u64_index("ibm,mmio-atsd", 0), Some(0x10));
        assert_eq!(node.get_prop_u64_index("ibm,mmio-atsd", 2), Some(0x30));
        assert_eq!(node.get_prop_u64_index("ibm,mmio-atsd", 3), None);
        assert_eq!(node.get_prop_u64_index("missing", 0), None);
    }

    #[test]
    fn phandles() {
        let mut fdt = Fdt::new();
        fdt.node_mut("/memory@2000000000000")
            .unwrap()
            .set_prop("phandle", 0x42u32)
            .unwrap();
        fdt.node_mut("/other").unwrap().set_prop("phandle", 1u32).unwrap();
        assert_eq!(
            fdt.node_by_phandle(0x42).unwrap().name(),
            "memory@2000000000000"
        );
        assert_eq!(fdt.node_by_phandle(1).unwrap().name(), "other");
        assert!(fdt.node_by_phandle(2).is_none());
    }

    #[test]
    fn c_str() {
        assert_eq!(c_str_to_string(b"abc\0"), Some("abc".to_owned()));
        assert_eq!(c_str_to_string(b"abc"), None);
        assert_eq!(c_str_to_string(b"a\0c\0"), None);
        assert_eq!(c_str_to_string(b""), None);
    }
}

//! Shortform extended-attribute reading.
//!
//! Only the inline (local) attribute fork layout is decoded; listing and
//! point lookup are offered read-only. Attribute writes are not supported.

use crate::Fork;
use uxfs_error::{Result, XfsError};
use uxfs_types::{read_be_u16, read_u8};

/// One decoded shortform attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xattr {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u8,
}

/// Decode the shortform attribute list from an attribute fork.
///
/// Layout: totsize(be16) count(u8) pad(u8), then per entry
/// namelen(u8) valuelen(u8) flags(u8) name value.
pub fn list(attr_fork: &Fork) -> Result<Vec<Xattr>> {
    let Some(raw) = attr_fork.local_bytes() else {
        // Extent-format attribute forks are beyond the read-only surface.
        return Ok(Vec::new());
    };
    if raw.len() < 4 {
        return Ok(Vec::new());
    }

    let totsize = usize::from(read_be_u16(raw, 0).map_err(fmt_err)?);
    let count = usize::from(read_u8(raw, 2).map_err(fmt_err)?);
    if totsize > raw.len() {
        return Err(XfsError::Format(
            "shortform attr totsize exceeds fork".to_owned(),
        ));
    }

    let mut out = Vec::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        let namelen = usize::from(read_u8(raw, pos).map_err(fmt_err)?);
        let valuelen = usize::from(read_u8(raw, pos + 1).map_err(fmt_err)?);
        let flags = read_u8(raw, pos + 2).map_err(fmt_err)?;
        let name_start = pos + 3;
        let value_start = name_start + namelen;
        let end = value_start + valuelen;
        if end > totsize {
            return Err(XfsError::Format(
                "shortform attr entry exceeds totsize".to_owned(),
            ));
        }
        out.push(Xattr {
            name: raw[name_start..value_start].to_vec(),
            value: raw[value_start..end].to_vec(),
            flags,
        });
        pos = end;
    }
    Ok(out)
}

/// Look up one attribute by name.
pub fn get(attr_fork: &Fork, name: &[u8]) -> Result<Option<Vec<u8>>> {
    Ok(list(attr_fork)?
        .into_iter()
        .find(|x| x.name == name)
        .map(|x| x.value))
}

fn fmt_err(e: uxfs_types::ParseError) -> XfsError {
    XfsError::Format(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf_attr_fork() -> Fork {
        // totsize, count=2, pad, then two entries.
        let mut raw = vec![0_u8; 4];
        for (name, value) in [(&b"user.a"[..], &b"1"[..]), (&b"user.bb"[..], &b"22"[..])] {
            raw.push(name.len() as u8);
            raw.push(value.len() as u8);
            raw.push(0);
            raw.extend_from_slice(name);
            raw.extend_from_slice(value);
        }
        let tot = raw.len() as u16;
        raw[0..2].copy_from_slice(&tot.to_be_bytes());
        raw[2] = 2;
        Fork::Local(raw)
    }

    #[test]
    fn list_and_get() {
        let fork = sf_attr_fork();
        let attrs = list(&fork).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].name, b"user.a");
        assert_eq!(attrs[0].value, b"1");
        assert_eq!(get(&fork, b"user.bb").unwrap(), Some(b"22".to_vec()));
        assert_eq!(get(&fork, b"user.zz").unwrap(), None);
    }

    #[test]
    fn empty_and_nonlocal_forks() {
        assert!(list(&Fork::Local(Vec::new())).unwrap().is_empty());
        assert!(list(&Fork::Extents(Vec::new())).unwrap().is_empty());
    }

    #[test]
    fn truncated_entry_rejected() {
        let mut raw = vec![0_u8; 4];
        raw[0..2].copy_from_slice(&20_u16.to_be_bytes());
        raw[2] = 1;
        raw.extend_from_slice(&[10, 10, 0]); // claims 10+10 bytes, has none
        assert!(list(&Fork::Local(raw)).is_err());
    }
}

use crate::primitives::bytes::var;
use crate::types::{Result, TreeError};

use super::layout::{LayoutRef, PackedLayout};
use super::update::Prepared;

/// Sorted string map stored in one segment.
///
/// Entries are `varint klen, varint vlen, key, value`, ordered by key bytes.
#[derive(Clone, Copy)]
pub struct PackedMap<'a> {
    bytes: &'a [u8],
}

/// Encoded segment contents produced by a prepare step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapUpdate {
    bytes: Vec<u8>,
}

impl MapUpdate {
    /// Size of the encoded segment.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true when the map would be empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Iterator over decoded entries.
pub struct PackedMapIter<'a> {
    bytes: &'a [u8],
    off: usize,
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| TreeError::Corruption("property is not utf-8"))
}

impl<'a> PackedMapIter<'a> {
    fn decode_next(&mut self) -> Result<(&'a str, &'a str)> {
        let bytes = self.bytes;
        let klen = var::decode_u64(bytes, &mut self.off)? as usize;
        let vlen = var::decode_u64(bytes, &mut self.off)? as usize;
        let start = self.off;
        let end = start
            .checked_add(klen)
            .and_then(|k| k.checked_add(vlen))
            .filter(|end| *end <= bytes.len())
            .ok_or(TreeError::Corruption("property entry overflows segment"))?;
        let key = utf8(&bytes[start..start + klen])?;
        let value = utf8(&bytes[start + klen..end])?;
        self.off = end;
        Ok((key, value))
    }
}

impl<'a> Iterator for PackedMapIter<'a> {
    type Item = Result<(&'a str, &'a str)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.off >= self.bytes.len() {
            return None;
        }
        let entry = self.decode_next();
        if entry.is_err() {
            self.off = self.bytes.len();
        }
        Some(entry)
    }
}

fn encode_entry(out: &mut Vec<u8>, key: &str, value: &str) {
    var::encode_u64(key.len() as u64, out);
    var::encode_u64(value.len() as u64, out);
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(value.as_bytes());
}

impl<'a> PackedMap<'a> {
    /// Wraps the used bytes of a map segment.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Encodes `entries` (any order, last duplicate wins).
    pub fn encode<'k>(entries: impl IntoIterator<Item = (&'k str, &'k str)>) -> Vec<u8> {
        let mut sorted: Vec<(&str, &str)> = Vec::new();
        for (key, value) in entries {
            match sorted.binary_search_by(|(k, _)| k.as_bytes().cmp(key.as_bytes())) {
                Ok(idx) => sorted[idx].1 = value,
                Err(idx) => sorted.insert(idx, (key, value)),
            }
        }
        let mut out = Vec::new();
        for (key, value) in sorted {
            encode_entry(&mut out, key, value);
        }
        out
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> PackedMapIter<'a> {
        PackedMapIter {
            bytes: self.bytes,
            off: 0,
        }
    }

    /// Looks up `key`.
    pub fn get(&self, key: &str) -> Result<Option<&'a str>> {
        for entry in self.iter() {
            let (k, v) = entry?;
            match k.as_bytes().cmp(key.as_bytes()) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(v)),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.iter() {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Returns true when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decodes every entry into owned strings.
    pub fn to_vec(&self) -> Result<Vec<(String, String)>> {
        self.iter()
            .map(|entry| entry.map(|(k, v)| (k.to_owned(), v.to_owned())))
            .collect()
    }

    fn rewrite(&self, key: &str, value: Option<&str>) -> Result<(Vec<u8>, bool)> {
        let mut out = Vec::with_capacity(self.bytes.len() + key.len() + 16);
        let mut placed = false;
        let mut existed = false;
        for entry in self.iter() {
            let (k, v) = entry?;
            match k.as_bytes().cmp(key.as_bytes()) {
                std::cmp::Ordering::Less => encode_entry(&mut out, k, v),
                std::cmp::Ordering::Equal => {
                    existed = true;
                    if let Some(value) = value {
                        encode_entry(&mut out, key, value);
                    }
                    placed = true;
                }
                std::cmp::Ordering::Greater => {
                    if !placed {
                        if let Some(value) = value {
                            encode_entry(&mut out, key, value);
                        }
                        placed = true;
                    }
                    encode_entry(&mut out, k, v);
                }
            }
        }
        if !placed {
            if let Some(value) = value {
                encode_entry(&mut out, key, value);
            }
        }
        Ok((out, existed))
    }

    /// Prepares setting `key` to `value` in segment `seg` of `layout`.
    pub fn prepare_set(
        layout: &LayoutRef<'_>,
        seg: usize,
        key: &str,
        value: &str,
    ) -> Result<Prepared<MapUpdate>> {
        let map = PackedMap::new(layout.segment(seg));
        let (bytes, _) = map.rewrite(key, Some(value))?;
        if layout.can_resize(seg, bytes.len()) {
            Ok(Prepared::Ready(MapUpdate { bytes }))
        } else {
            Ok(Prepared::NeedsSpace {
                extra: layout.growth_needed(seg, bytes.len()),
            })
        }
    }

    /// Prepares removing `key`; `None` when the key is absent.
    pub fn prepare_remove(
        layout: &LayoutRef<'_>,
        seg: usize,
        key: &str,
    ) -> Result<Option<MapUpdate>> {
        let map = PackedMap::new(layout.segment(seg));
        let (bytes, existed) = map.rewrite(key, None)?;
        Ok(existed.then_some(MapUpdate { bytes }))
    }

    /// Writes a prepared update.
    pub fn commit<B: AsRef<[u8]> + AsMut<[u8]>>(
        layout: &mut PackedLayout<B>,
        seg: usize,
        update: MapUpdate,
    ) -> Result<()> {
        layout.resize_segment(seg, update.bytes.len())?;
        layout.segment_mut(seg).copy_from_slice(&update.bytes);
        Ok(())
    }
}

//! Hash maps: walking `hmap` buckets.
//!
//! A map caught in the middle of growing has two bucket arrays. Buckets of
//! the new array that have not been filled yet are read from the old bucket
//! they will be split from, once, so every key is produced exactly once.

use std::sync::Arc;

use super::{Kind, LoadConfig, Variable, MAX_ERR_COUNT};
use crate::binary::TypeKind;
use crate::error::{QuarryError, QuarryResult};
use crate::memory::{cache_memory, dereference_memory};

/// Tag of an empty slot.
const TOPHASH_EMPTY: u64 = 0;
/// Tags below this mark slots of an evacuated bucket.
const TOPHASH_MIN: u64 = 4;

fn malformed(detail: &str) -> QuarryError
{
    QuarryError::MalformedType(format!("malformed map type: {detail}"))
}

/// Tag, key and value arrays of the bucket being walked
struct Slots
{
    tophashes: Variable,
    keys: Variable,
    values: Variable,
}

/// Cursor over the key/value slots of one map
pub struct MapIterator
{
    num_buckets: u64,
    old_mask: u64,
    buckets: Option<Variable>,
    old_buckets: Option<Variable>,
    bidx: u64,

    slots: Option<Slots>,
    overflow: Option<Variable>,
    idx: i64,

    err: Option<QuarryError>,
}

impl MapIterator
{
    fn empty() -> Self
    {
        Self {
            num_buckets: 0,
            old_mask: 0,
            buckets: None,
            old_buckets: None,
            bidx: 0,
            slots: None,
            overflow: None,
            idx: 0,
            err: None,
        }
    }

    /// The error that ended the iteration early, if any.
    pub fn err(&self) -> Option<&QuarryError>
    {
        self.err.as_ref()
    }

    fn fail(&mut self, err: QuarryError) -> bool
    {
        self.err = Some(err);
        false
    }

    /// Bucket `index` of a bucket array.
    fn bucket_at(array: &Variable, index: u64) -> Variable
    {
        let size = array.dwarf_type.map_or(0, |ty| array.bi.types().size(ty));
        let mut bucket = array.clone();
        bucket.addr = array.addr.offset(size * index as i64);
        bucket
    }

    /// Whether an old bucket has been moved to the new array already.
    ///
    /// Unreadable buckets count as evacuated.
    fn evacuated(bucket: &Variable) -> bool
    {
        if bucket.addr.is_null() {
            return true;
        }
        let Some(real) = bucket.real() else {
            return true;
        };
        let Some(field) = real.field("tophash") else {
            return true;
        };
        let first = bucket
            .to_field(field)
            .and_then(|tophash| tophash.slice_access(0))
            .and_then(|mut slot| slot.as_uint());
        match first {
            Ok(tophash) => tophash > TOPHASH_EMPTY && tophash < TOPHASH_MIN,
            Err(_) => true,
        }
    }

    fn next_bucket(&mut self) -> bool
    {
        let overflow = self.overflow.take().filter(|overflow| !overflow.addr.is_null());
        let mut bucket = match overflow {
            Some(overflow) => overflow,
            None => {
                let (Some(buckets), Some(old_buckets)) = (&self.buckets, &self.old_buckets) else {
                    return false;
                };
                let mut chosen = None;
                while self.bidx < self.num_buckets {
                    let candidate = Self::bucket_at(buckets, self.bidx);
                    if old_buckets.addr.is_null() {
                        chosen = Some(candidate);
                        break;
                    }
                    let old_index = self.bidx & self.old_mask;
                    let old = Self::bucket_at(old_buckets, old_index);
                    if Self::evacuated(&old) {
                        chosen = Some(candidate);
                        break;
                    }
                    if old_index == self.bidx {
                        chosen = Some(old);
                        break;
                    }
                    // Already produced through its old bucket
                    self.bidx += 1;
                }
                let Some(chosen) = chosen else {
                    return false;
                };
                self.bidx += 1;
                chosen
            }
        };
        if bucket.addr.is_null() {
            return false;
        }

        let Some(real) = bucket.real() else {
            return self.fail(malformed("bucket without a type"));
        };
        bucket.mem = cache_memory(&bucket.mem, bucket.addr, real.size.max(0) as usize);

        self.slots = None;
        let (mut tophashes, mut keys, mut values) = (None, None, None);
        for field in real.fields() {
            let field_var = match bucket.to_field(field) {
                Ok(field_var) => field_var,
                Err(err) => return self.fail(err),
            };
            if let Some(err) = &field_var.unreadable {
                return self.fail(err.clone());
            }
            match field.name.as_str() {
                "tophash" => tophashes = Some(field_var),
                "keys" => keys = Some(field_var),
                "values" => values = Some(field_var),
                "overflow" => self.overflow = Some(field_var.maybe_dereference()),
                _ => {}
            }
        }

        let (Some(tophashes), Some(keys), Some(values), Some(overflow)) = (tophashes, keys, values, &self.overflow)
        else {
            return self.fail(malformed("bucket is missing fields"));
        };
        if tophashes.kind != Kind::Array || keys.kind != Kind::Array || values.kind != Kind::Array {
            return self.fail(malformed("bucket contents are not arrays"));
        }
        if tophashes.len != keys.len {
            return self.fail(malformed("inconsistent bucket key count"));
        }
        let value_size = values.field_type.map_or(0, |ty| values.bi.types().size(ty));
        if value_size > 0 && tophashes.len != values.len {
            return self.fail(malformed("inconsistent bucket value count"));
        }
        if overflow.kind != Kind::Struct {
            return self.fail(malformed("overflow is not a bucket"));
        }
        self.slots = Some(Slots {
            tophashes,
            keys,
            values,
        });
        true
    }

    /// Advance to the next occupied slot.
    pub fn next(&mut self) -> bool
    {
        loop {
            let exhausted = self.slots.as_ref().map_or(true, |slots| self.idx >= slots.tophashes.len);
            if exhausted {
                if !self.next_bucket() {
                    return false;
                }
                self.idx = 0;
            }

            let Some(slots) = &self.slots else {
                return false;
            };
            let tophash = slots.tophashes.slice_access(self.idx).and_then(|mut slot| slot.as_uint());
            let tophash = match tophash {
                Ok(tophash) => tophash,
                Err(err) => return self.fail(QuarryError::unreadable("tophash", &err)),
            };
            self.idx += 1;
            if tophash != TOPHASH_EMPTY {
                return true;
            }
        }
    }

    fn current(&self) -> QuarryResult<&Slots>
    {
        match &self.slots {
            Some(slots) if self.idx > 0 => Ok(slots),
            _ => Err(QuarryError::InvalidAccess("map iterator is not on an entry".into())),
        }
    }

    /// Key of the current slot.
    pub fn key(&self) -> QuarryResult<Variable>
    {
        self.current()?.keys.slice_access(self.idx - 1)
    }

    /// Value of the current slot.
    ///
    /// Values of zero size all live at the start of the value array.
    pub fn value(&self) -> QuarryResult<Variable>
    {
        let values = &self.current()?.values;
        match values.field_type {
            Some(elem) if values.bi.types().size(elem) == 0 => Ok(Variable::new(
                "",
                values.addr,
                elem,
                dereference_memory(&values.mem),
                Arc::clone(&values.bi),
            )),
            _ => values.slice_access(self.idx - 1),
        }
    }
}

impl Variable
{
    /// Read the map header: element count, bucket arrays, table size.
    ///
    /// Sets `len` and `base` of the map. A nil map yields an iterator that
    /// produces nothing.
    pub(crate) fn map_iterator(&mut self) -> QuarryResult<MapIterator>
    {
        let real = self.real().ok_or_else(|| QuarryError::MalformedType("wrong real type for map".into()))?;
        let TypeKind::Map { header, .. } = real.kind else {
            return Err(QuarryError::MalformedType("wrong real type for map".into()));
        };
        let mut hmap = self.retyped(header).maybe_dereference();
        if let Some(err) = hmap.unreadable.take() {
            return Err(err);
        }
        self.base = hmap.addr;

        let Some(record) = hmap.real().filter(|record| matches!(record.kind, TypeKind::Struct(_))) else {
            return Err(QuarryError::MalformedType("wrong real type for map".into()));
        };
        if hmap.addr.is_null() {
            self.len = 0;
            return Ok(MapIterator::empty());
        }
        hmap.mem = cache_memory(&hmap.mem, hmap.addr, record.size.max(0) as usize);

        let mut it = MapIterator::empty();
        for field in record.fields() {
            let mut field_var = hmap.to_field(field)?;
            match field.name.as_str() {
                "count" => self.len = field_var.as_int()?,
                "B" => {
                    let b = field_var.as_uint()?;
                    it.num_buckets = u32::try_from(b)
                        .ok()
                        .and_then(|b| 1u64.checked_shl(b))
                        .ok_or_else(|| QuarryError::MalformedType(format!("map has 2^{b} buckets")))?;
                    it.old_mask = if b == 0 { 0 } else { (1 << (b - 1)) - 1 };
                }
                "buckets" => it.buckets = Some(field_var.maybe_dereference()),
                "oldbuckets" => it.old_buckets = Some(field_var.maybe_dereference()),
                _ => {}
            }
        }

        let is_struct = |bucket: &Option<Variable>| bucket.as_ref().is_some_and(|bucket| bucket.kind == Kind::Struct);
        if !is_struct(&it.buckets) || !is_struct(&it.old_buckets) {
            return Err(QuarryError::MalformedType("map buckets are not structs".into()));
        }
        Ok(it)
    }

    /// Load up to `cfg.max_array_values` entries as alternating key and
    /// value children.
    pub(crate) fn load_map(&mut self, level: i32, cfg: &LoadConfig) -> QuarryResult<()>
    {
        let mut it = self.map_iterator()?;
        if self.len == 0 || cfg.max_array_values == 0 {
            return Ok(());
        }

        let mut count = 0;
        let mut errors = 0;
        while it.next() {
            let mut key = it.key()?;
            let mut value = it.value()?;
            key.load_value_internal(level + 1, cfg);
            value.load_value_internal(level + 1, cfg);
            if key.unreadable.is_some() || value.unreadable.is_some() {
                errors += 1;
            }
            self.children.push(key);
            self.children.push(value);
            count += 1;
            if errors > MAX_ERR_COUNT || count >= cfg.max_array_values || count as i64 >= self.len {
                break;
            }
        }
        match it.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

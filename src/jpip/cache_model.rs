

//! The per-client record of how many bytes of every data-bin
//! the client already holds.
//!
//! All counters grow monotonically for the lifetime of one channel.
//! The value `u32::MAX` marks a data-bin as completely transferred,
//! which is the on-wire JPIP idiom for cache model updates.

use crate::jpip::DataBinClass;


/// The number of bytes of one data-bin known to the client,
/// counted from bin offset zero.
///
/// A typed wrapper, so that the completeness sentinel can never be
/// pushed over by plain arithmetic.
#[derive(
    Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash,
    serde::Serialize, serde::Deserialize,
)]
pub struct Amount(u32);

impl Amount {

    pub const ZERO: Amount = Amount(0);

    /// The whole data-bin has been transferred.
    pub const COMPLETE: Amount = Amount(u32::MAX);

    pub fn bytes(count: u32) -> Self { Amount(count) }

    #[inline]
    pub fn is_complete(self) -> bool { self == Amount::COMPLETE }

    /// The byte count this amount stands for.
    #[inline]
    pub fn value(self) -> u32 { self.0 }

    /// Increases the amount. Once complete, an amount never changes again.
    pub fn add(&mut self, delta: u32, complete: bool) -> Amount {
        if !self.is_complete() {
            if complete || delta == u32::MAX { *self = Amount::COMPLETE; }
            else { self.0 = self.0.saturating_add(delta); }
        }

        *self
    }

    /// The component-wise maximum, used when merging models.
    fn merge(&mut self, other: Amount) {
        *self = (*self).max(other);
    }
}


/// The cache model of one codestream.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CodestreamCache {
    main_header: Amount,
    tile_header: Amount,

    /// The precinct the first entry of `precincts` belongs to. Packing
    /// removes completed precincts from the head of the vector and
    /// advances this index accordingly.
    min_precinct: u64,

    precincts: Vec<Amount>,
}

impl CodestreamCache {

    pub fn main_header(&self) -> Amount { self.main_header }

    pub fn add_to_main_header(&mut self, delta: u32, complete: bool) -> Amount {
        self.main_header.add(delta, complete)
    }

    pub fn tile_header(&self) -> Amount { self.tile_header }

    pub fn add_to_tile_header(&mut self, delta: u32, complete: bool) -> Amount {
        self.tile_header.add(delta, complete)
    }

    pub fn min_precinct(&self) -> u64 { self.min_precinct }

    /// The amount of one precinct data-bin.
    /// Precincts packed away from the head are complete by definition.
    pub fn precinct(&mut self, precinct: u64) -> Amount {
        match self.precinct_slot(precinct) {
            None => Amount::COMPLETE,
            Some(slot) => {
                if slot >= self.precincts.len() {
                    self.precincts.resize(slot + 1, Amount::ZERO);
                }

                self.precincts[slot]
            }
        }
    }

    pub fn add_to_precinct(&mut self, precinct: u64, delta: u32, complete: bool) -> Amount {
        match self.precinct_slot(precinct) {
            None => Amount::COMPLETE,
            Some(slot) => {
                if slot >= self.precincts.len() {
                    self.precincts.resize(slot + 1, Amount::ZERO);
                }

                self.precincts[slot].add(delta, complete)
            }
        }
    }

    fn precinct_slot(&self, precinct: u64) -> Option<usize> {
        precinct.checked_sub(self.min_precinct)
            .map(crate::error::u64_to_usize)
    }

    /// Component-wise maximum with another codestream model.
    pub fn merge(&mut self, other: &CodestreamCache) {
        self.main_header.merge(other.main_header);
        self.tile_header.merge(other.tile_header);

        for (slot, amount) in other.precincts.iter().enumerate() {
            let precinct = other.min_precinct + slot as u64;
            let merged = self.precinct(precinct).max(*amount);

            if let Some(own_slot) = self.precinct_slot(precinct) {
                self.precincts[own_slot] = merged;
            }
        }
    }

    /// Removes the longest prefix of completed precincts, advancing
    /// `min_precinct`, but only when the prefix has at least `min_run`
    /// entries. This bounds the memory of long sessions.
    pub fn pack(&mut self, min_run: usize) {
        let run = self.precincts.iter()
            .take_while(|amount| amount.is_complete())
            .count();

        if run >= min_run {
            self.precincts.drain(.. run);
            self.min_precinct += run as u64;
        }
    }

    /// The first retained precinct is never complete after packing,
    /// unless nothing is retained at all.
    #[cfg(test)]
    fn is_packed(&self) -> bool {
        self.precincts.first().map_or(true, |first| !first.is_complete())
    }
}


/// The complete cache model of one client channel.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CacheModel {

    /// Whether the meta-data has been transferred completely.
    /// While this is set, the `metadata` vector stays empty.
    full_meta: bool,

    metadata: Vec<Amount>,
    codestreams: Vec<CodestreamCache>,
}

impl CacheModel {

    pub fn new() -> Self { CacheModel::default() }

    pub fn is_full_metadata(&self) -> bool { self.full_meta }

    /// Marks the whole meta-data as transferred
    /// and drops the per-bin amounts.
    pub fn set_full_metadata(&mut self) {
        self.full_meta = true;
        self.metadata.clear();
    }

    pub fn metadata(&mut self, id: u64) -> Amount {
        if self.full_meta { return Amount::COMPLETE; }

        let slot = crate::error::u64_to_usize(id);
        if slot >= self.metadata.len() {
            self.metadata.resize(slot + 1, Amount::ZERO);
        }

        self.metadata[slot]
    }

    pub fn add_to_metadata(&mut self, id: u64, delta: u32, complete: bool) -> Amount {
        if self.full_meta { return Amount::COMPLETE; }

        let slot = crate::error::u64_to_usize(id);
        if slot >= self.metadata.len() {
            self.metadata.resize(slot + 1, Amount::ZERO);
        }

        self.metadata[slot].add(delta, complete)
    }

    /// The model of one codestream, grown on demand.
    pub fn codestream(&mut self, codestream: usize) -> &mut CodestreamCache {
        if codestream >= self.codestreams.len() {
            self.codestreams.resize(codestream + 1, CodestreamCache::default());
        }

        &mut self.codestreams[codestream]
    }

    /// The amount the client holds of one data-bin.
    /// Classes this server never produces are always empty.
    pub fn bin(&mut self, class: DataBinClass, codestream: usize, id: u64) -> Amount {
        match class {
            DataBinClass::MetaData => self.metadata(id),
            DataBinClass::MainHeader => self.codestream(codestream).main_header(),
            DataBinClass::TileHeader => self.codestream(codestream).tile_header(),
            DataBinClass::Precinct => self.codestream(codestream).precinct(id),
            _ => Amount::ZERO,
        }
    }

    /// Increases the amount of one data-bin. Monotonic:
    /// a completed bin stays complete.
    pub fn add_to_bin(&mut self, class: DataBinClass, codestream: usize, id: u64, delta: u32, complete: bool) -> Amount {
        match class {
            DataBinClass::MetaData => self.add_to_metadata(id, delta, complete),
            DataBinClass::MainHeader => self.codestream(codestream).add_to_main_header(delta, complete),
            DataBinClass::TileHeader => self.codestream(codestream).add_to_tile_header(delta, complete),
            DataBinClass::Precinct => self.codestream(codestream).add_to_precinct(id, delta, complete),
            _ => Amount::ZERO,
        }
    }

    /// Merges another model into this one, component-wise maximum.
    /// Used to apply the `model=` updates a client announces.
    pub fn merge(&mut self, other: &CacheModel) {
        if other.full_meta {
            self.set_full_metadata();
        }
        else if !self.full_meta {
            for (id, amount) in other.metadata.iter().enumerate() {
                let merged = self.metadata(id as u64).max(*amount);
                self.metadata[id] = merged;
            }
        }

        for (index, codestream) in other.codestreams.iter().enumerate() {
            self.codestream(index).merge(codestream);
        }
    }

    /// Packs every codestream model.
    pub fn pack(&mut self, min_run: usize) {
        for codestream in &mut self.codestreams {
            codestream.pack(min_run);
        }
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.full_meta = false;
        self.metadata.clear();
        self.codestreams.clear();
    }
}

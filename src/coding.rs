

//! Coding parameters of a JPEG 2000 codestream and the arithmetic
//! that maps packets to their position in the progression order.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::math::{ceil_div, level_size, RoundingMode, Size, Vec2};


/// All the progression orders defined in Part 1 of the JPEG 2000 standard.
/// Only the first three can be served, because the packet index relies on
/// computing the progression position of a packet in constant time.
#[derive(Debug, Clone, Copy, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Progression {
    Lrcp,
    Rlcp,
    Rpcl,
    Pcrl,
    Cprl,
}

impl Progression {

    /// Decodes the progression byte of a COD marker.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Progression::Lrcp),
            1 => Ok(Progression::Rlcp),
            2 => Ok(Progression::Rpcl),
            3 => Ok(Progression::Pcrl),
            4 => Ok(Progression::Cprl),
            _ => Err(Error::bad_image(format!("progression order code {}", code))),
        }
    }

    /// Whether packets of lower resolutions strictly precede
    /// all packets of higher resolutions in the codestream.
    pub fn is_resolution_major(self) -> bool {
        self == Progression::Rlcp || self == Progression::Rpcl
    }
}


/// Identifies one packet within a codestream:
/// a quality layer of one precinct of one component at one resolution.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Packet {

    /// Quality layer, starting at zero.
    pub layer: u32,

    /// Resolution level, zero being the lowest resolution.
    pub resolution: u32,

    /// Color component.
    pub component: u32,

    /// Precinct coordinates within the precinct grid of the resolution.
    pub precinct: Vec2<u32>,
}


/// The coding parameters shared by all codestreams of one image,
/// read from the SIZ and COD markers.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CodingParameters {

    /// Size of the image on the highest resolution grid.
    pub size: Size,

    /// Number of wavelet decomposition levels.
    pub num_levels: u32,

    /// Number of quality layers.
    pub num_layers: u32,

    /// Number of color components.
    pub num_components: u32,

    /// The order of the packets in the codestream.
    pub progression: Option<Progression>,

    /// Precinct size for each resolution level, lowest resolution first.
    /// Contains `num_levels + 1` entries.
    pub precinct_size: SmallVec<[Size; 8]>,

    /// Cumulative precinct counts: entry `r` is the total number of
    /// precincts of all resolutions below `r`, across all components.
    /// Filled once after parsing; contains `num_levels + 2` entries.
    pub(crate) total_precincts: Vec<u64>,
}

impl CodingParameters {

    /// Precomputes the cumulative precinct counts.
    /// Must be called once the SIZ and COD markers have been read.
    pub fn fill_total_precincts(&mut self) {
        let mut below = 0_u64;

        self.total_precincts.clear();
        self.total_precincts.push(below);

        for resolution in 0 ..= self.num_levels {
            below += self.precincts(resolution, self.size).map(u64::from).area();
            self.total_precincts.push(below);
        }
    }

    /// The total number of precincts of all resolutions below the given one.
    #[inline]
    pub fn total_precincts_below(&self, resolution: u32) -> u64 {
        debug_assert!(!self.total_precincts.is_empty(), "totals were never filled");
        self.total_precincts[resolution as usize]
    }

    /// Projects a point on the highest resolution grid onto the precinct
    /// grid of the given resolution level.
    pub fn precincts(&self, resolution: u32, point: Size) -> Vec2<u32> {
        let shift = self.num_levels - resolution;
        let precinct = self.precinct_size[resolution as usize];

        Vec2(
            ceil_div(ceil_div(point.x(), 1_u64 << shift), precinct.x()) as u32,
            ceil_div(ceil_div(point.y(), 1_u64 << shift), precinct.y()) as u32,
        )
    }

    /// The position of the packet in the codestream, according to the
    /// progression order. Fails for the unsupported progressions.
    pub fn progression_index(&self, packet: Packet) -> Result<u64> {
        let components = u64::from(self.num_components);
        let layers = u64::from(self.num_layers);

        let grid = self.precincts(packet.resolution, self.size).map(u64::from);
        let grid_area = grid.area();

        let layer = u64::from(packet.layer);
        let component = u64::from(packet.component);
        let precinct = packet.precinct.map(u64::from);
        let below = self.total_precincts_below(packet.resolution);

        match self.progression {
            Some(Progression::Lrcp) => Ok(
                layer * self.total_precincts_below(self.num_levels + 1) * components
                    + components * below
                    + component * grid_area
                    + precinct.y() * grid.x() + precinct.x()
            ),

            Some(Progression::Rlcp) => Ok(
                below * components * layers
                    + layer * components * grid_area
                    + component * grid_area
                    + precinct.y() * grid.x() + precinct.x()
            ),

            Some(Progression::Rpcl) => Ok(
                below * components * layers
                    + precinct.y() * grid.x() * components * layers
                    + precinct.x() * components * layers
                    + component * layers
                    + layer
            ),

            Some(Progression::Pcrl) | Some(Progression::Cprl) =>
                Err(Error::unsupported("PCRL and CPRL progression orders")),

            None => Err(Error::bad_image("codestream without COD marker")),
        }
    }

    /// The JPIP data-bin identifier of the precinct the packet belongs to.
    pub fn precinct_data_bin_id(&self, packet: Packet) -> u64 {
        let grid = self.precincts(packet.resolution, self.size).map(u64::from);
        let precinct = packet.precinct.map(u64::from);

        let in_image = self.total_precincts_below(packet.resolution)
            + grid.x() * precinct.y() + precinct.x();

        u64::from(packet.component) + in_image * u64::from(self.num_components)
    }

    /// The identifier of the last packet of the whole image.
    pub fn last_packet(&self) -> Packet {
        let grid = self.precincts(self.num_levels, self.size);

        Packet {
            layer: self.num_layers - 1,
            resolution: self.num_levels,
            component: self.num_components - 1,
            precinct: Vec2(grid.x() - 1, grid.y() - 1),
        }
    }

    /// Chooses the resolution level whose image size matches the requested
    /// frame size best, according to the rounding mode. Returns the number
    /// of levels to decode (`num_levels - r`) and the image size at the
    /// chosen level.
    pub fn round_resolution(&self, frame_size: Size, mode: RoundingMode) -> (u32, Size) {
        match mode {
            RoundingMode::Up => self.round_resolution_up(frame_size),
            RoundingMode::Down => self.round_resolution_down(frame_size),
            RoundingMode::Closest => self.round_resolution_closest(frame_size),
        }
    }

    fn size_at_level(&self, level: u32) -> Size {
        Vec2(level_size(self.size.x(), level), level_size(self.size.y(), level))
    }

    fn round_resolution_up(&self, frame_size: Size) -> (u32, Size) {
        // starts at the smallest level and grows until both axes cover the request
        for level in (0 ..= self.num_levels).rev() {
            let size = self.size_at_level(level);
            if size.x() >= frame_size.x() && size.y() >= frame_size.y() {
                return (self.num_levels - level, size);
            }
        }

        (self.num_levels, self.size_at_level(0))
    }

    fn round_resolution_down(&self, frame_size: Size) -> (u32, Size) {
        for level in 0 ..= self.num_levels {
            let size = self.size_at_level(level);
            if size.x() <= frame_size.x() && size.y() <= frame_size.y() {
                return (self.num_levels - level, size);
            }
        }

        (0, self.size_at_level(self.num_levels))
    }

    fn round_resolution_closest(&self, frame_size: Size) -> (u32, Size) {
        let distance = |size: Size| {
            (size.x() as i64 - frame_size.x() as i64).abs()
                + (size.y() as i64 - frame_size.y() as i64).abs()
        };

        let mut best_level = 0;
        let mut best_size = self.size_at_level(0);
        let mut best_distance = distance(best_size);

        for level in 1 ..= self.num_levels {
            let size = self.size_at_level(level);

            if distance(size) < best_distance {
                best_distance = distance(size);
                best_size = size;
                best_level = level;
            }
        }

        (self.num_levels - best_level, best_size)
    }
}



//! The window of interest and the composer that enumerates
//! every packet covering it, in LRCP order.

use crate::coding::{CodingParameters, Packet};
use crate::math::{Point, Size, Vec2};


/// A window of interest: a rectangle within the image
/// at one of its resolution levels.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct Woi {

    /// Upper-left corner, in pixels of the chosen resolution.
    pub position: Point,

    /// Extent, in pixels of the chosen resolution.
    pub size: Size,

    /// The number of resolution levels to decode;
    /// `num_levels` requests the full resolution.
    pub resolution: u32,
}


/// Walks all packets whose precincts cover a window of interest,
/// in LRCP order: precinct column innermost, then precinct row,
/// component, resolution and quality layer.
///
/// The precinct range of each resolution is widened by one step
/// towards the origin, so that boundary precincts are always included.
#[derive(Debug, Default, Clone, Copy)]
pub struct WoiComposer {
    corner_min: Point,
    corner_max: Point,
    max_resolution: u32,
    min_precinct: Vec2<u32>,
    max_precinct: Vec2<u32>,
    current: Packet,
    more_packets: bool,
}

impl WoiComposer {

    /// A composer with no packets available.
    pub fn new() -> Self { WoiComposer::default() }

    /// Starts a new enumeration over the packets of the given window.
    pub fn reset(&mut self, parameters: &CodingParameters, woi: &Woi) {
        self.more_packets = true;
        self.current = Packet::default();
        self.max_resolution = woi.resolution;

        // project the window corners back onto the highest resolution grid
        let scale = 1_u64 << (parameters.num_levels - woi.resolution);
        self.corner_min = woi.position * scale;
        self.corner_max = (woi.position + woi.size).map(|c| c.saturating_sub(1)) * scale;

        self.update_precinct_range(parameters);
        self.current.precinct = self.min_precinct;
    }

    /// The packet the enumeration currently points at,
    /// or `None` once all packets were visited.
    pub fn current(&self) -> Option<Packet> {
        if self.more_packets { Some(self.current) }
        else { None }
    }

    /// Moves to the next packet of the window.
    /// Returns false once the enumeration is finished.
    pub fn advance(&mut self, parameters: &CodingParameters) -> bool {
        if !self.more_packets {
            return false;
        }

        let packet = &mut self.current;

        if packet.precinct.0 < self.max_precinct.x() {
            packet.precinct.0 += 1;
            return true;
        }

        packet.precinct.0 = self.min_precinct.x();

        if packet.precinct.1 < self.max_precinct.y() {
            packet.precinct.1 += 1;
            return true;
        }

        packet.precinct.1 = self.min_precinct.y();

        if packet.component < parameters.num_components - 1 {
            packet.component += 1;
            return true;
        }

        packet.component = 0;

        if packet.resolution < self.max_resolution {
            packet.resolution += 1;
        }
        else {
            packet.resolution = 0;

            if packet.layer < parameters.num_layers - 1 {
                packet.layer += 1;
            }
            else {
                self.more_packets = false;
                return false;
            }
        }

        self.update_precinct_range(parameters);
        self.current.precinct = self.min_precinct;
        true
    }

    /// Recomputes the covered precinct range for the current resolution,
    /// with the conservative one-step widening towards the origin.
    fn update_precinct_range(&mut self, parameters: &CodingParameters) {
        let mut min = parameters.precincts(self.current.resolution, self.corner_min);
        if min.0 != 0 { min.0 -= 1; }
        if min.1 != 0 { min.1 -= 1; }

        let mut max = parameters.precincts(self.current.resolution, self.corner_max);
        if max.0 != 0 { max.0 -= 1; }
        if max.1 != 0 { max.1 -= 1; }

        self.min_precinct = min;
        self.max_precinct = max;
    }
}

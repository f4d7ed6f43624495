//! Pixel layout: electronics address to physical pixel mapping.
//!
//! A layout assigns each `(chip, channel)` electronics address to a physical
//! pixel id. From one [`LayoutDescription`] two tables are derived together:
//!
//! - the pixel lookup, `chip key -> [pixel id per channel]`, used on the
//!   ingest path to resolve which pixel a hit belongs to;
//! - the chip lookup, `pixel id -> {chip, channel}`, its inverse, used by
//!   operators to find the electronics behind a pixel.
//!
//! Both live in one immutable [`PixelTables`] value so they can never drift
//! apart. [`PixelMap`] holds the active tables behind an `Arc`; a reload
//! builds the new tables completely and then swaps the pointer, so a reader
//! sees either the old layout or the new one, never a mix.
//!
//! # Layout Files
//!
//! ```json
//! {
//!   "name": "v2a",
//!   "io_group": 1,
//!   "io_channel": 1,
//!   "chips": [[3, [0, 1, null, 2]], [4, [3, 4, 5, 6]]]
//! }
//! ```
//!
//! `io_group` and `io_channel` default to 1. [`LayoutCatalog`] resolves a
//! layout name to `<dir>/layout-<name>.json`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;
use crate::record::ChipKey;

/// Number of addressable channels per chip (7-bit channel field).
pub const MAX_CHANNELS: usize = 128;

/// Physical pixel identifier.
pub type PixelId = u16;

/// One chip's channel assignments: `[chip_id, [pixel or null per channel]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipAssignment(pub u16, pub Vec<Option<PixelId>>);

/// A layout as loaded from a layout file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutDescription {
    /// Layout identifier.
    pub name: String,
    /// Chip group every chip in this layout is attached to.
    #[serde(default = "default_io")]
    pub io_group: u8,
    /// Chip-channel index every chip in this layout is attached to.
    #[serde(default = "default_io")]
    pub io_channel: u8,
    /// Per-chip channel assignments.
    pub chips: Vec<ChipAssignment>,
}

fn default_io() -> u8 {
    1
}

impl LayoutDescription {
    /// Reads a layout file.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::Read`] or [`LayoutError::Parse`].
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, LayoutError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| LayoutError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&data).map_err(|e| LayoutError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// The chip key for a chip id in this layout.
    pub fn chip_key(&self, chip_id: u16) -> ChipKey {
        ChipKey::new(self.io_group, self.io_channel, chip_id)
    }
}

/// Electronics address of one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelAddress {
    /// The chip.
    pub chip: ChipKey,
    /// The channel on that chip.
    pub channel: u8,
}

/// The active layout plus both derived lookups. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct PixelTables {
    layout: Option<LayoutDescription>,
    pixel_lookup: HashMap<ChipKey, Vec<Option<PixelId>>>,
    chip_lookup: BTreeMap<PixelId, ChannelAddress>,
}

impl PixelTables {
    /// Tables with no layout: every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds both lookups from a layout in one pass.
    ///
    /// # Errors
    ///
    /// - [`LayoutError::DuplicateChip`] if a chip appears twice
    /// - [`LayoutError::TooManyChannels`] if a chip lists more than
    ///   [`MAX_CHANNELS`] entries
    /// - [`LayoutError::PixelOutOfRange`] if a pixel id is `>= pixel_count`
    /// - [`LayoutError::DuplicatePixelAssignment`] if a pixel is assigned to
    ///   two electronics addresses
    pub fn build(layout: LayoutDescription, pixel_count: usize) -> Result<Self, LayoutError> {
        let mut pixel_lookup = HashMap::with_capacity(layout.chips.len());
        let mut chip_lookup: BTreeMap<PixelId, ChannelAddress> = BTreeMap::new();

        for ChipAssignment(chip_id, pixels) in &layout.chips {
            let chip = layout.chip_key(*chip_id);

            if pixels.len() > MAX_CHANNELS {
                return Err(LayoutError::TooManyChannels {
                    chip: chip.to_string(),
                    channels: pixels.len(),
                    max: MAX_CHANNELS,
                });
            }

            for (channel, pixel) in pixels.iter().enumerate() {
                let Some(pixel) = *pixel else { continue };

                if usize::from(pixel) >= pixel_count {
                    return Err(LayoutError::PixelOutOfRange { pixel, pixel_count });
                }

                #[allow(clippy::cast_possible_truncation)] // bounded by MAX_CHANNELS
                let address = ChannelAddress {
                    chip,
                    channel: channel as u8,
                };
                if let Some(existing) = chip_lookup.insert(pixel, address) {
                    return Err(LayoutError::DuplicatePixelAssignment {
                        pixel,
                        first: format!("{}/{}", existing.chip, existing.channel),
                        second: format!("{}/{}", address.chip, address.channel),
                    });
                }
            }

            if pixel_lookup.insert(chip, pixels.clone()).is_some() {
                return Err(LayoutError::DuplicateChip {
                    chip: chip.to_string(),
                });
            }
        }

        Ok(Self {
            layout: Some(layout),
            pixel_lookup,
            chip_lookup,
        })
    }

    /// Resolves an electronics address to its pixel.
    ///
    /// Returns `None` for an unknown chip or an unassigned channel; both are
    /// normal (unused channels exist on every chip).
    pub fn lookup_pixel(&self, chip: &ChipKey, channel: u8) -> Option<PixelId> {
        self.pixel_lookup
            .get(chip)?
            .get(usize::from(channel))
            .copied()
            .flatten()
    }

    /// Resolves a pixel to its electronics address.
    pub fn lookup_address(&self, pixel: PixelId) -> Option<&ChannelAddress> {
        self.chip_lookup.get(&pixel)
    }

    /// The layout these tables were built from, if any.
    pub fn layout(&self) -> Option<&LayoutDescription> {
        self.layout.as_ref()
    }

    /// Number of chips in the layout.
    pub fn chip_count(&self) -> usize {
        self.pixel_lookup.len()
    }

    /// Number of pixels with an electronics address.
    pub fn mapped_pixels(&self) -> usize {
        self.chip_lookup.len()
    }

    /// The layout and its chip lookup, for inspection.
    pub fn report(&self) -> LayoutReport<'_> {
        LayoutReport {
            layout: self.layout.as_ref(),
            lookup: &self.chip_lookup,
        }
    }
}

/// Serializable view of the active layout.
#[derive(Debug, Serialize)]
pub struct LayoutReport<'a> {
    /// The active layout, `null` if none is loaded.
    pub layout: Option<&'a LayoutDescription>,
    /// `pixel -> {chip, channel}`.
    pub lookup: &'a BTreeMap<PixelId, ChannelAddress>,
}

/// The active pixel tables, replaced wholesale on reload.
#[derive(Debug, Clone)]
pub struct PixelMap {
    tables: Arc<PixelTables>,
    pixel_count: usize,
}

impl PixelMap {
    /// Creates a map with no layout for `pixel_count` pixels.
    pub fn new(pixel_count: usize) -> Self {
        Self {
            tables: Arc::new(PixelTables::empty()),
            pixel_count,
        }
    }

    /// Builds tables from `layout` and makes them active.
    ///
    /// The current tables stay active if the layout is invalid.
    ///
    /// # Errors
    ///
    /// See [`PixelTables::build`].
    pub fn load(&mut self, layout: LayoutDescription) -> Result<Arc<PixelTables>, LayoutError> {
        let tables = Arc::new(PixelTables::build(layout, self.pixel_count)?);
        self.replace(Arc::clone(&tables));
        Ok(tables)
    }

    /// Makes already-built tables active.
    pub fn replace(&mut self, tables: Arc<PixelTables>) {
        if let Some(layout) = tables.layout() {
            tracing::info!(
                layout = %layout.name,
                chips = tables.chip_count(),
                pixels = tables.mapped_pixels(),
                "pixel layout loaded"
            );
        }
        self.tables = tables;
    }

    /// Resolves an electronics address against the active tables.
    pub fn lookup_pixel(&self, chip: &ChipKey, channel: u8) -> Option<PixelId> {
        self.tables.lookup_pixel(chip, channel)
    }

    /// A handle on the active tables.
    pub fn tables(&self) -> Arc<PixelTables> {
        Arc::clone(&self.tables)
    }

    /// Size of the per-pixel tables.
    pub fn pixel_count(&self) -> usize {
        self.pixel_count
    }
}

/// Resolves layout names to layout files in a directory.
#[derive(Debug, Clone)]
pub struct LayoutCatalog {
    dir: PathBuf,
}

impl LayoutCatalog {
    /// Creates a catalog over `dir`.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// The file a layout name maps to.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::InvalidName`] for names that are empty or
    /// contain anything but ASCII alphanumerics, `-`, `_` and `.`, or that
    /// contain `..`.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, LayoutError> {
        let valid = !name.is_empty()
            && !name.contains("..")
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(LayoutError::InvalidName {
                name: name.to_string(),
            });
        }

        Ok(self.dir.join(format!("layout-{name}.json")))
    }

    /// Resolves and reads a named layout.
    ///
    /// # Errors
    ///
    /// See [`LayoutCatalog::resolve`] and [`LayoutDescription::from_path`].
    pub fn load(&self, name: &str) -> Result<LayoutDescription, LayoutError> {
        LayoutDescription::from_path(self.resolve(name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout(chips: Vec<ChipAssignment>) -> LayoutDescription {
        LayoutDescription {
            name: "test".to_string(),
            io_group: 1,
            io_channel: 1,
            chips,
        }
    }

    #[test]
    fn test_build_both_lookups() {
        let tables = PixelTables::build(
            layout(vec![
                ChipAssignment(3, vec![Some(0), Some(1), None, Some(2)]),
                ChipAssignment(4, vec![Some(3)]),
            ]),
            832,
        )
        .unwrap();

        let chip3 = ChipKey::new(1, 1, 3);
        assert_eq!(tables.lookup_pixel(&chip3, 0), Some(0));
        assert_eq!(tables.lookup_pixel(&chip3, 3), Some(2));
        assert_eq!(
            tables.lookup_address(3),
            Some(&ChannelAddress {
                chip: ChipKey::new(1, 1, 4),
                channel: 0,
            })
        );
        assert_eq!(tables.chip_count(), 2);
        assert_eq!(tables.mapped_pixels(), 4);
    }

    #[test]
    fn test_unmapped_lookups_are_none() {
        let tables =
            PixelTables::build(layout(vec![ChipAssignment(3, vec![Some(0), None])]), 832).unwrap();

        // unassigned channel
        assert_eq!(tables.lookup_pixel(&ChipKey::new(1, 1, 3), 1), None);
        // channel past the end of the chip's list
        assert_eq!(tables.lookup_pixel(&ChipKey::new(1, 1, 3), 60), None);
        // unknown chip
        assert_eq!(tables.lookup_pixel(&ChipKey::new(2, 1, 3), 0), None);
        assert_eq!(PixelTables::empty().lookup_pixel(&ChipKey::new(1, 1, 3), 0), None);
    }

    #[test]
    fn test_duplicate_pixel_rejected() {
        let err = PixelTables::build(
            layout(vec![
                ChipAssignment(3, vec![Some(5)]),
                ChipAssignment(4, vec![None, Some(5)]),
            ]),
            832,
        )
        .unwrap_err();

        match err {
            LayoutError::DuplicatePixelAssignment {
                pixel,
                first,
                second,
            } => {
                assert_eq!(pixel, 5);
                assert_eq!(first, "1-1-3/0");
                assert_eq!(second, "1-1-4/1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_chip_rejected() {
        let err = PixelTables::build(
            layout(vec![
                ChipAssignment(3, vec![Some(1)]),
                ChipAssignment(3, vec![Some(2)]),
            ]),
            832,
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::DuplicateChip { .. }));
    }

    #[test]
    fn test_pixel_out_of_range_rejected() {
        let err =
            PixelTables::build(layout(vec![ChipAssignment(3, vec![Some(832)])]), 832).unwrap_err();
        assert!(matches!(
            err,
            LayoutError::PixelOutOfRange {
                pixel: 832,
                pixel_count: 832
            }
        ));
    }

    #[test]
    fn test_too_many_channels_rejected() {
        let err = PixelTables::build(
            layout(vec![ChipAssignment(3, vec![None; MAX_CHANNELS + 1])]),
            832,
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::TooManyChannels { .. }));
    }

    #[test]
    fn test_failed_load_keeps_previous_tables() {
        let mut map = PixelMap::new(832);
        map.load(layout(vec![ChipAssignment(3, vec![Some(7)])]))
            .unwrap();

        let bad = layout(vec![ChipAssignment(9, vec![Some(1), Some(1)])]);
        assert!(map.load(bad).is_err());

        assert_eq!(map.lookup_pixel(&ChipKey::new(1, 1, 3), 0), Some(7));
        assert_eq!(map.lookup_pixel(&ChipKey::new(1, 1, 9), 0), None);
    }

    #[test]
    fn test_replace_is_wholesale() {
        let mut map = PixelMap::new(832);
        let old = map
            .load(layout(vec![ChipAssignment(3, vec![Some(7)])]))
            .unwrap();

        let new = Arc::new(
            PixelTables::build(layout(vec![ChipAssignment(4, vec![Some(8)])]), 832).unwrap(),
        );
        map.replace(Arc::clone(&new));

        // A reader holding the old tables still sees a complete old layout.
        assert_eq!(old.lookup_pixel(&ChipKey::new(1, 1, 3), 0), Some(7));
        assert_eq!(map.lookup_pixel(&ChipKey::new(1, 1, 3), 0), None);
        assert_eq!(map.lookup_pixel(&ChipKey::new(1, 1, 4), 0), Some(8));
    }

    #[test]
    fn test_layout_json_format() {
        let json = r#"{"name": "v2a", "chips": [[3, [0, 1, null, 2]]]}"#;
        let desc: LayoutDescription = serde_json::from_str(json).unwrap();
        assert_eq!(desc.io_group, 1);
        assert_eq!(desc.io_channel, 1);
        assert_eq!(desc.chips[0], ChipAssignment(3, vec![Some(0), Some(1), None, Some(2)]));

        let tables = PixelTables::build(desc, 832).unwrap();
        let report = serde_json::to_value(tables.report()).unwrap();
        assert_eq!(report["layout"]["name"], "v2a");
        assert_eq!(report["lookup"]["2"]["chip"], "1-1-3");
        assert_eq!(report["lookup"]["2"]["channel"], 3);
    }

    #[test]
    fn test_catalog_resolves_names() {
        let dir = tempdir().unwrap();
        let catalog = LayoutCatalog::new(dir.path());

        assert_eq!(
            catalog.resolve("2.2.1").unwrap(),
            dir.path().join("layout-2.2.1.json")
        );
        assert!(catalog.resolve("").is_err());
        assert!(catalog.resolve("../etc").is_err());
        assert!(catalog.resolve("a/b").is_err());
    }

    #[test]
    fn test_catalog_load() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("layout-small.json"),
            r#"{"name": "small", "io_group": 2, "chips": [[5, [10, 11]]]}"#,
        )
        .unwrap();

        let catalog = LayoutCatalog::new(dir.path());
        let desc = catalog.load("small").unwrap();
        assert_eq!(desc.chip_key(5), ChipKey::new(2, 1, 5));

        assert!(matches!(catalog.load("missing"), Err(LayoutError::Read { .. })));
    }
}

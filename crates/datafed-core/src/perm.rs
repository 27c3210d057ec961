//! Access permission bits.
//!
//! Grants on records and collections are stored as bitmasks. Collections
//! carry two masks per grantee: `grant` applies to the collection itself and
//! `inhgrant` is inherited by everything the collection contains.

/// Read the record summary.
pub const RD_REC: u32 = 0x0001;
/// Read record metadata.
pub const RD_META: u32 = 0x0002;
/// Read raw data.
pub const RD_DATA: u32 = 0x0004;
/// Write the record summary.
pub const WR_REC: u32 = 0x0008;
/// Write record metadata.
pub const WR_META: u32 = 0x0010;
/// Write raw data.
pub const WR_DATA: u32 = 0x0020;
/// List collection contents.
pub const LIST: u32 = 0x0040;
/// Link and unlink collection items.
pub const LINK: u32 = 0x0080;
/// Create items inside a collection.
pub const CREATE: u32 = 0x0100;
/// Delete the item.
pub const DELETE: u32 = 0x0200;
/// Change sharing.
pub const SHARE: u32 = 0x0400;

/// All read bits.
pub const RD_ALL: u32 = RD_REC | RD_META | RD_DATA;
/// All write bits.
pub const WR_ALL: u32 = WR_REC | WR_META | WR_DATA;
/// Every permission bit.
pub const ALL: u32 = 0x7fff;
/// Bits granted to anyone on public (topic-bearing) collections.
pub const PUBLIC: u32 = RD_ALL | LIST;

/// Returns true when `have` contains every bit of `need`.
#[must_use]
pub const fn covers(have: u32, need: u32) -> bool {
    have & need == need
}

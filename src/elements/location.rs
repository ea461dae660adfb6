/// Longitude and latitude packed into one 64 bit word: each coordinate
/// quantized linearly onto 32 bits, longitude in the high half.
pub type PackedLocation = u64;

/// Sentinel for "no location stored". The south-west corner of the
/// coordinate space (-180, -90) also encodes to zero; no real OSM node
/// sits exactly there.
pub const MISSING_LOCATION: PackedLocation = 0;

const COORD_STEPS: f64 = u32::MAX as f64;

pub fn encode_location(lon: f64, lat: f64) -> PackedLocation {
    let lon = lon.clamp(-180.0, 180.0);
    let lat = lat.clamp(-90.0, 90.0);
    let x = (((lon + 180.0) / 360.0) * COORD_STEPS).round() as u64;
    let y = (((lat + 90.0) / 180.0) * COORD_STEPS).round() as u64;
    (x << 32) | y
}

pub fn decode_location(loc: PackedLocation) -> (f64, f64) {
    let lon = ((loc >> 32) as f64) / COORD_STEPS * 360.0 - 180.0;
    let lat = ((loc & 0xffff_ffff) as f64) / COORD_STEPS * 180.0 - 90.0;
    (lon, lat)
}

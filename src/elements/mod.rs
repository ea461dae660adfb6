mod element;
mod location;
mod tags;

pub use element::{ElementType, Member, Node, ReaderElement, Relation, Way};
pub use location::{
    decode_location, encode_location, PackedLocation, MISSING_LOCATION,
};
pub use tags::{find_tag, has_tag, Tag};

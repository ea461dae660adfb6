use crate::elements::Relation;
use crate::osmread::features::SourceFeature;

/// A rendered feature is exactly a sort entry: key plus opaque payload.
pub type RenderedFeature = crate::featuresort::Entry;

/// Opaque relation summary produced by a Profile in pass 1 and handed
/// back when its member ways are processed in pass 2: a type tag the
/// Profile understands plus its own encoded bytes.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct RelationInfo {
    pub type_tag: i64,
    pub data: Vec<u8>,
}

impl RelationInfo {
    pub fn new(type_tag: i64, data: Vec<u8>) -> RelationInfo {
        RelationInfo {
            type_tag: type_tag,
            data: data,
        }
    }

    /// Upper bound on the retained heap footprint, for the pass-1
    /// memory accounting.
    pub fn size_bytes(&self) -> usize {
        48 + self.data.len()
    }
}

/// The tag->feature mapping supplied by the caller.
pub trait Profile: Send + Sync + 'static {
    type Renderable: Send + 'static;

    /// Called once per relation in pass 1; an empty result means the
    /// relation is of no interest to way processing.
    fn preprocess_relation(&self, relation: &Relation) -> Vec<RelationInfo>;

    /// Called once per source feature in pass 2; may emit any number of
    /// renderables.
    fn process_feature(&self, feature: &SourceFeature, out: &mut Vec<Self::Renderable>);
}

/// Turns renderables into rendered features for the sort.
pub trait FeatureRenderer<R>: Send + Sync + 'static {
    fn render(&self, renderable: R, out: &mut Vec<RenderedFeature>);
}

use crate::elements::tags::{has_tag, Tag};

#[derive(Debug, Eq, PartialEq, Clone, Ord, PartialOrd, Copy)]
pub enum ElementType {
    Node,
    Way,
    Relation,
}

impl ElementType {
    pub fn from_int(t: u64) -> ElementType {
        match t {
            0 => ElementType::Node,
            1 => ElementType::Way,
            2 => ElementType::Relation,
            _ => {
                panic!("wrong element type");
            }
        }
    }
    pub fn as_int(&self) -> u64 {
        match self {
            ElementType::Node => 0,
            ElementType::Way => 1,
            ElementType::Relation => 2,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Member {
    pub role: String,
    pub mem_type: ElementType,
    pub mem_ref: i64,
}

impl Member {
    pub fn new(role: &str, mem_type: ElementType, mem_ref: i64) -> Member {
        Member {
            role: String::from(role),
            mem_type: mem_type,
            mem_ref: mem_ref,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Node {
    pub id: i64,
    pub lon: f64,
    pub lat: f64,
    pub tags: Vec<Tag>,
}

impl Node {
    pub fn new(id: i64, lon: f64, lat: f64) -> Node {
        Node {
            id: id,
            lon: lon,
            lat: lat,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Way {
    pub id: i64,
    pub refs: Vec<i64>,
    pub tags: Vec<Tag>,
}

impl Way {
    pub fn new(id: i64, refs: Vec<i64>) -> Way {
        Way {
            id: id,
            refs: refs,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Relation {
    pub id: i64,
    pub members: Vec<Member>,
    pub tags: Vec<Tag>,
}

impl Relation {
    pub fn new(id: i64) -> Relation {
        Relation {
            id: id,
            members: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn is_multipolygon(&self) -> bool {
        has_tag(&self.tags, "type", "multipolygon")
    }

    pub fn way_members(&self) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .filter(|m| m.mem_type == ElementType::Way)
    }
}

/// One element from the PBF collaborator; workers dispatch on the tag.
#[derive(Debug, PartialEq, Clone)]
pub enum ReaderElement {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl ReaderElement {
    pub fn get_type(&self) -> ElementType {
        match self {
            ReaderElement::Node(_) => ElementType::Node,
            ReaderElement::Way(_) => ElementType::Way,
            ReaderElement::Relation(_) => ElementType::Relation,
        }
    }

    pub fn get_id(&self) -> i64 {
        match self {
            ReaderElement::Node(n) => n.id,
            ReaderElement::Way(w) => w.id,
            ReaderElement::Relation(r) => r.id,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SynonymSpec {
    pub canonical: &'static str,
    pub synonyms: &'static [&'static str],
}

impl SynonymSpec {
    /// Exact synonym membership.
    pub fn lists(&self, term: &str) -> bool {
        self.synonyms.iter().any(|synonym| *synonym == term)
    }

    /// Exact membership, or the label embeds one of the synonyms ("white wall" → wall).
    pub fn covers_label(&self, label: &str) -> bool {
        self.lists(label) || self.synonyms.iter().any(|synonym| label.contains(synonym))
    }
}

/// Order matters: the first entry covering a label wins.
pub const OBJECT_SYNONYMS: &[SynonymSpec] = &[
    SynonymSpec {
        canonical: "wall",
        synonyms: &["wall", "walls", "wall surface"],
    },
    SynonymSpec {
        canonical: "floor",
        synonyms: &["floor", "ground", "flooring", "tiles", "tile"],
    },
    SynonymSpec {
        canonical: "ceiling",
        synonyms: &["ceiling", "ceiling surface"],
    },
    SynonymSpec {
        canonical: "sofa",
        synonyms: &["sofa", "couch", "settee"],
    },
    SynonymSpec {
        canonical: "bed",
        synonyms: &["bed", "mattress"],
    },
    SynonymSpec {
        canonical: "table",
        synonyms: &["table", "desk", "dining table"],
    },
    SynonymSpec {
        canonical: "cabinet",
        synonyms: &["cabinet", "cupboard", "wardrobe"],
    },
    SynonymSpec {
        canonical: "window",
        synonyms: &["window", "windows"],
    },
    SynonymSpec {
        canonical: "door",
        synonyms: &["door", "doors"],
    },
    SynonymSpec {
        canonical: "lamp",
        synonyms: &["lamp", "light", "lighting", "lights"],
    },
];

pub fn canonical_for_label(label: &str) -> Option<&'static str> {
    OBJECT_SYNONYMS
        .iter()
        .find(|entry| entry.covers_label(label))
        .map(|entry| entry.canonical)
}

pub fn canonical_for_synonym(term: &str) -> Option<&'static str> {
    OBJECT_SYNONYMS
        .iter()
        .find(|entry| entry.lists(term))
        .map(|entry| entry.canonical)
}

#[cfg(test)]
mod tests {
    use super::{canonical_for_label, canonical_for_synonym};

    #[test]
    fn labels_map_through_embedded_synonyms() {
        assert_eq!(canonical_for_label("couch"), Some("sofa"));
        assert_eq!(canonical_for_label("white brick wall"), Some("wall"));
        assert_eq!(canonical_for_label("pendant lights"), Some("lamp"));
        assert_eq!(canonical_for_label("plant"), None);
    }

    #[test]
    fn table_order_decides_ambiguous_labels() {
        // "tile" belongs to floor and floor precedes lamp, so a tiled light fixture is a floor.
        assert_eq!(canonical_for_label("tile light"), Some("floor"));
    }

    #[test]
    fn synonym_lookup_is_exact() {
        assert_eq!(canonical_for_synonym("settee"), Some("sofa"));
        assert_eq!(canonical_for_synonym("settees"), None);
    }
}

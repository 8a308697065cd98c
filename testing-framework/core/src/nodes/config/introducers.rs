use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Contents of `private/introducers.yaml`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct IntroducersFile {
    #[serde(default)]
    pub introducers: BTreeMap<String, IntroducerEntry>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct IntroducerEntry {
    pub furl: String,
}

impl IntroducersFile {
    /// Insert or replace an entry. Returns true when the file changed.
    pub fn upsert(&mut self, name: &str, furl: &str) -> bool {
        let entry = IntroducerEntry {
            furl: furl.to_owned(),
        };
        if self.introducers.get(name) == Some(&entry) {
            return false;
        }
        self.introducers.insert(name.to_owned(), entry);
        true
    }
}

use serde::{Deserialize, Serialize};

/// Policy number plus the abbreviated initials printed next to it in the export.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    pub insurance_number: String,
    pub initials: String,
}

impl LookupKey {
    pub fn new(insurance_number: impl Into<String>, initials: impl Into<String>) -> Self {
        Self {
            insurance_number: insurance_number.into().trim().to_string(),
            initials: initials.into().trim().to_uppercase(),
        }
    }
}

/// Full name returned by the registry (or loaded from the cache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRecord {
    pub insurance_number: String,
    pub surname: String,
    pub given_name: String,
    pub patronymic: String,
}

impl ResolvedRecord {
    pub fn new(
        insurance_number: &str,
        surname: &str,
        given_name: &str,
        patronymic: &str,
    ) -> Self {
        Self {
            insurance_number: insurance_number.trim().to_string(),
            surname: normalize_name_part(surname),
            given_name: normalize_name_part(given_name),
            patronymic: normalize_name_part(patronymic),
        }
    }

    /// First letters of surname, given name and patronymic; an empty patronymic adds nothing.
    pub fn initials(&self) -> String {
        [&self.surname, &self.given_name, &self.patronymic]
            .iter()
            .filter_map(|part| part.chars().next())
            .collect()
    }

    pub fn match_key(&self) -> LookupKey {
        LookupKey {
            insurance_number: self.insurance_number.clone(),
            initials: self.initials(),
        }
    }
}

pub fn normalize_name_part(value: &str) -> String {
    value.trim().to_uppercase()
}

// Extras get the same normalization treatment as package names: PEP 685
// finally settled the argument by declaring that extra names compare by the
// PEP 503 rules. We just reuse PackageName's machinery wholesale.

use crate::prelude::*;

#[derive(
    Debug, Clone, Deserialize, Serialize, Hash, PartialEq, Eq, PartialOrd, Ord,
)]
pub struct Extra(PackageName);

impl Extra {
    pub fn as_given(&self) -> &str {
        self.0.as_given()
    }

    pub fn canonical(&self) -> &str {
        self.0.canonical()
    }
}

impl TryFrom<&str> for Extra {
    type Error = eyre::Report;

    fn try_from(s: &str) -> Result<Self> {
        Ok(Extra(s.try_into()?))
    }
}

try_from_str_boilerplate!(Extra);

impl Display for Extra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_given())
    }
}

use serde::{Deserialize, Serialize};

/// A balance holder. `System` collects fees and reserves; `Mint` is the
/// unlimited-supply source whose balance may go negative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Account {
    System,
    Mint,
    Named(String),
}

impl Account {
    pub fn named(name: impl Into<String>) -> Self {
        Account::from(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Account::System => "system",
            Account::Mint => "mint",
            Account::Named(name) => name,
        }
    }

    pub fn is_mint(&self) -> bool {
        matches!(self, Account::Mint)
    }
}

impl From<String> for Account {
    fn from(s: String) -> Self {
        match s.as_str() {
            "system" => Account::System,
            "mint" => Account::Mint,
            _ => Account::Named(s),
        }
    }
}

impl From<&str> for Account {
    fn from(s: &str) -> Self {
        Account::from(s.to_string())
    }
}

impl From<Account> for String {
    fn from(account: Account) -> Self {
        account.as_str().to_string()
    }
}

impl std::fmt::Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

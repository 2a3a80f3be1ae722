/// Trust level attached to every cached rdataset.
///
/// The cache refuses downgrades: an rdataset already stored at a higher
/// trust level is never replaced by data learned from a weaker source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Trust {
    /// From the additional section of a response.
    Additional,
    /// Glue addresses carried alongside a referral.
    Glue,
    /// From the answer section of a non-authoritative response.
    Answer,
    /// From the authority section of an authoritative response.
    AuthAuthority,
    /// From the answer section of an authoritative response.
    AuthAnswer,
}

impl Trust {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trust::Additional => "additional",
            Trust::Glue => "glue",
            Trust::Answer => "answer",
            Trust::AuthAuthority => "authauthority",
            Trust::AuthAnswer => "authanswer",
        }
    }
}

impl std::fmt::Display for Trust {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_is_ascending() {
        assert!(Trust::Additional < Trust::Glue);
        assert!(Trust::Glue < Trust::Answer);
        assert!(Trust::Answer < Trust::AuthAuthority);
        assert!(Trust::AuthAuthority < Trust::AuthAnswer);
    }
}

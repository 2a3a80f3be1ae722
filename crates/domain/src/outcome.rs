/// Terminal result of a successful fetch.
///
/// "Successful" here means the resolver learned something definite: a
/// positive answer, the head of a CNAME/DNAME chain, or a cached negative.
/// Fetch-terminating failures travel as `ResolverError` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A positive answer for the asked (name, type).
    Success,
    /// The answer is a CNAME; the caller restarts at the target.
    Cname,
    /// The answer is a DNAME; the caller restarts at the synthesized name.
    Dname,
    /// The name does not exist (cached negative, covers ANY).
    NcacheNxDomain,
    /// The name exists but has no rdataset of the asked type.
    NcacheNxRrset,
}

impl FetchOutcome {
    pub fn is_negative(&self) -> bool {
        matches!(
            self,
            FetchOutcome::NcacheNxDomain | FetchOutcome::NcacheNxRrset
        )
    }

    pub fn is_chained(&self) -> bool {
        matches!(self, FetchOutcome::Cname | FetchOutcome::Dname)
    }
}

impl std::fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FetchOutcome::Success => "success",
            FetchOutcome::Cname => "cname",
            FetchOutcome::Dname => "dname",
            FetchOutcome::NcacheNxDomain => "ncachenxdomain",
            FetchOutcome::NcacheNxRrset => "ncachenxrrset",
        };
        f.write_str(s)
    }
}

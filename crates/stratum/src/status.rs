use super::*;

/// Share status code as carried in `CMD_SUBMIT_RESPONSE`.
///
/// The accepting values are deliberately singular bit patterns rather than
/// small integers so that a stray memory corruption or truncation is very
/// unlikely to turn a reject into an accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShareStatus(pub u32);

impl ShareStatus {
    pub const ACCEPT: Self = Self(1798084231);
    pub const ACCEPT_STALE: Self = Self(950395421);
    pub const SOLVED: Self = Self(1422486894);
    pub const SOLVED_STALE: Self = Self(1713984938);
    pub const SOLVED_PRELIMINARY: Self = Self(1835617709);

    pub const REJECT_NO_REASON: Self = Self(0);

    pub const JOB_NOT_FOUND_OR_STALE: Self = Self(21);
    pub const DUPLICATE_SHARE: Self = Self(22);
    pub const LOW_DIFFICULTY: Self = Self(23);
    pub const UNAUTHORIZED: Self = Self(24);
    pub const NOT_SUBSCRIBED: Self = Self(25);

    pub const ILLEGAL_METHOD: Self = Self(26);
    pub const ILLEGAL_PARAMS: Self = Self(27);
    pub const IP_BANNED: Self = Self(28);
    pub const INVALID_USERNAME: Self = Self(29);
    pub const INTERNAL_ERROR: Self = Self(30);
    pub const TIME_TOO_OLD: Self = Self(31);
    pub const TIME_TOO_NEW: Self = Self(32);
    pub const ILLEGAL_VERMASK: Self = Self(33);

    pub const INVALID_SOLUTION: Self = Self(34);
    pub const WRONG_NONCE_PREFIX: Self = Self(35);

    pub const JOB_NOT_FOUND: Self = Self(36);
    pub const STALE_SHARE: Self = Self(37);

    pub const UNKNOWN: Self = Self(0x7fffffff);

    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            Self::ACCEPT | Self::ACCEPT_STALE | Self::SOLVED | Self::SOLVED_STALE
        )
    }

    pub fn is_solved(self) -> bool {
        matches!(
            self,
            Self::SOLVED | Self::SOLVED_STALE | Self::SOLVED_PRELIMINARY
        )
    }

    pub fn is_stale(self) -> bool {
        matches!(
            self,
            Self::ACCEPT_STALE
                | Self::SOLVED_STALE
                | Self::JOB_NOT_FOUND_OR_STALE
                | Self::STALE_SHARE
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ACCEPT => "Share accepted",
            Self::ACCEPT_STALE => "Share accepted (stale)",
            Self::SOLVED => "Share accepted and solved",
            Self::SOLVED_STALE => "Share accepted and solved (stale)",
            Self::SOLVED_PRELIMINARY => "Share accepted and solved (preliminary)",
            Self::REJECT_NO_REASON => "Share rejected",
            Self::JOB_NOT_FOUND_OR_STALE => "Job not found (=stale)",
            Self::DUPLICATE_SHARE => "Duplicate share",
            Self::LOW_DIFFICULTY => "Low difficulty",
            Self::UNAUTHORIZED => "Unauthorized worker",
            Self::NOT_SUBSCRIBED => "Not subscribed",
            Self::ILLEGAL_METHOD => "Illegal method",
            Self::ILLEGAL_PARAMS => "Illegal params",
            Self::IP_BANNED => "Ip banned",
            Self::INVALID_USERNAME => "Invalid username",
            Self::INTERNAL_ERROR => "Internal error",
            Self::TIME_TOO_OLD => "Time too old",
            Self::TIME_TOO_NEW => "Time too new",
            Self::ILLEGAL_VERMASK => "Invalid version mask",
            Self::INVALID_SOLUTION => "Invalid solution",
            Self::WRONG_NONCE_PREFIX => "Wrong nonce prefix",
            Self::JOB_NOT_FOUND => "Job not found",
            Self::STALE_SHARE => "Stale share",
            _ => "Unknown",
        }
    }

    pub fn to_error(self) -> StratumError {
        StratumError::new(self.0 as i32, self.description())
    }
}

impl fmt::Display for ShareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepting_statuses() {
        assert!(ShareStatus::ACCEPT.is_accepted());
        assert!(ShareStatus::ACCEPT_STALE.is_accepted());
        assert!(ShareStatus::SOLVED.is_accepted());
        assert!(ShareStatus::SOLVED_STALE.is_accepted());

        assert!(!ShareStatus::SOLVED_PRELIMINARY.is_accepted());
        assert!(!ShareStatus::REJECT_NO_REASON.is_accepted());
        assert!(!ShareStatus::LOW_DIFFICULTY.is_accepted());
        assert!(!ShareStatus::UNKNOWN.is_accepted());
    }

    #[test]
    fn small_integers_never_accept() {
        for code in 0..4096 {
            assert!(!ShareStatus(code).is_accepted(), "code {code}");
        }
    }

    #[test]
    fn unknown_code_falls_back() {
        assert_eq!(ShareStatus(123456).description(), "Unknown");
    }

    #[test]
    fn rejection_maps_to_stratum_error() {
        let err = ShareStatus::LOW_DIFFICULTY.to_error();
        assert_eq!(err.code, 23);
        assert_eq!(err.message, "Low difficulty");
    }
}

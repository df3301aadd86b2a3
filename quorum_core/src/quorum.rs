//! Quorum arithmetic.
//!
//! With `n` servers the protocol tolerates `f = n / 2` omission-faulty
//! servers. Sizes are always computed from the live membership at the
//! moment they are needed, never cached.

/// Number of faulty servers tolerated by `n` servers.
pub fn max_faulty(n: usize) -> usize {
    n / 2
}

/// Replies required to complete a read (and a PAY): `n - f`.
pub fn read_quorum(n: usize) -> usize {
    n - max_faulty(n)
}

/// Replies required to confirm a write: `f + 1`.
pub fn write_quorum(n: usize) -> usize {
    max_faulty(n) + 1
}

/// Which quorum a continuation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    /// `n - f` distinct replies
    Read,
    /// `f + 1` distinct replies
    Write,
}

impl Quota {
    /// Resolves the quota against the current server count.
    pub fn required(&self, servers: usize) -> usize {
        match self {
            Quota::Read => read_quorum(servers),
            Quota::Write => write_quorum(servers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_sizes_for_odd_clusters() {
        assert_eq!((read_quorum(3), write_quorum(3)), (2, 2));
        assert_eq!((read_quorum(5), write_quorum(5)), (3, 3));
        assert_eq!((read_quorum(7), write_quorum(7)), (4, 4));
    }

    #[test]
    fn test_quorum_sizes_for_even_clusters() {
        // Even n: write quorum exceeds read quorum by one
        assert_eq!((read_quorum(4), write_quorum(4)), (2, 3));
        assert_eq!((read_quorum(6), write_quorum(6)), (3, 4));
        assert_eq!(max_faulty(6), 3);
    }

    #[test]
    fn test_read_quorums_intersect_write_quorums() {
        for n in 1..=15 {
            assert!(read_quorum(n) + write_quorum(n) > n, "n = {n}");
        }
    }

    #[test]
    fn test_quota_resolves_late() {
        let quota = Quota::Read;
        assert_eq!(quota.required(7), 4);
        // Membership shrank while waiting
        assert_eq!(quota.required(5), 3);
        assert_eq!(Quota::Write.required(4), 3);
    }
}

use rand::{distr::Alphanumeric, Rng};
use rustix::io::{Errno, Result as ErrnoResult};

pub(crate) trait ErrnoFilter<T> {
    fn filter_errno(self, ignored: Errno) -> ErrnoResult<Option<T>>;
}

impl<T> ErrnoFilter<T> for ErrnoResult<T> {
    fn filter_errno(self, ignored: Errno) -> ErrnoResult<Option<T>> {
        match self {
            Ok(result) => Ok(Some(result)),
            Err(err) if err == ignored => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// A name for a temporary sibling file: `prefix` followed by 12 random alphanumerics.
pub(crate) fn generate_tmpname(prefix: &str) -> String {
    let rand_string: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, rand_string)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_filter_errno() {
        let ok: ErrnoResult<u8> = Ok(1);
        assert_eq!(ok.filter_errno(Errno::EXIST), Ok(Some(1)));

        let ignored: ErrnoResult<u8> = Err(Errno::EXIST);
        assert_eq!(ignored.filter_errno(Errno::EXIST), Ok(None));

        let other: ErrnoResult<u8> = Err(Errno::NOENT);
        assert_eq!(other.filter_errno(Errno::EXIST), Err(Errno::NOENT));
    }

    #[test]
    fn test_generate_tmpname() {
        let a = generate_tmpname(".symlink-");
        let b = generate_tmpname(".symlink-");
        assert!(a.starts_with(".symlink-"));
        assert_eq!(a.len(), ".symlink-".len() + 12);
        assert!(a != b);
    }
}

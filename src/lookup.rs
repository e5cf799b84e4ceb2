/// Outcome of asking an evidence source for something.
///
/// `Missing` means the source answered and has nothing; `Unavailable` means
/// the source could not answer at all (store down, permission error). The
/// reconciler treats both as "no evidence from this tier" but logs them
/// differently.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    Missing,
    Unavailable,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::Missing | Lookup::Unavailable => None,
        }
    }

    pub fn as_found(&self) -> Option<&T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::Missing | Lookup::Unavailable => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Lookup::Unavailable)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::Missing => Lookup::Missing,
            Lookup::Unavailable => Lookup::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn found_and_map() {
        assert_eq!(Lookup::Found(2).map(|v| v * 2).found(), Some(4));
        assert_eq!(Lookup::<i32>::Missing.found(), None);
        assert!(Lookup::<i32>::Unavailable.is_unavailable());
        assert!(!Lookup::<i32>::Missing.is_unavailable());
    }
}

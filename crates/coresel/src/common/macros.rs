/// Newtype over `u32` for the engine's id spaces (nodes, jobs, partitions,
/// switches), so a node index cannot be fed into a job table by accident.
/// The `usize` conversion exists for `IndexVec` and bitmap positions.
#[macro_export]
macro_rules! define_id_type {
    ($name: ident) => {
        #[derive(
            ::std::marker::Copy,
            ::std::clone::Clone,
            ::std::fmt::Debug,
            ::std::hash::Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
            ::std::cmp::Ord,
            ::std::cmp::PartialOrd,
            ::std::cmp::Eq,
            ::std::cmp::PartialEq,
        )]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub fn new(value: u32) -> Self {
                Self(value)
            }

            #[inline]
            pub fn as_num(&self) -> u32 {
                self.0
            }
        }

        impl ::std::convert::From<u32> for $name {
            #[inline]
            fn from(value: u32) -> Self {
                Self::new(value)
            }
        }

        impl ::std::convert::From<$name> for usize {
            #[inline]
            fn from(id: $name) -> Self {
                id.0 as usize
            }
        }

        impl ::std::fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

pub use define_id_type;

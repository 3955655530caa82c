#![macro_use]

pub(crate) const fn range_mask(range: std::ops::Range<usize>) -> u64 {
    if range.end % 64 == 0 {
        !((1u64 << range.start % 64) - 1)
    } else {
        ((1u64 << range.end % 64) - 1) & !((1u64 << range.start % 64) - 1)
    }
}

pub(crate) fn value_at_mask(value: impl Into<u64>, mask: u64) -> u64 {
    assert!(mask != 0, "value mask is zero");

    let value = value.into();
    let res = value << mask.trailing_zeros();
    debug_assert!(
        res & !mask == 0,
        "value {value} is wider than mask {:#x}",
        mask
    );
    res
}

/// Implement basic methods for packed flag words.
macro_rules! impl_flag_word_basic_methods {
    ($FlagT:ty, $bits:expr) => {
        impl $FlagT {
            /// Create an all-clear flag word.
            pub fn new() -> Self {
                Self(::bitvec::prelude::BitArray::ZERO)
            }

            ::paste::paste! {
                /// Interpret the flag word as an integer.
                pub fn [<as_u $bits>](&self) -> [<u $bits>] {
                    self.0.load_le()
                }

                /// Rebuild a flag word from its integer form.
                pub fn [<from_u $bits>](raw: [<u $bits>]) -> Self {
                    let mut word = Self::new();
                    word.0.store_le(raw);
                    word
                }
            }
        }

        impl Default for $FlagT {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

/// Implement a setter and a getter for a single-bit flag.
/// Must use within an `impl` block.
macro_rules! define_flag_accessor {
    ($flag:ident, $bit:expr) => {
        pub fn $flag(self) -> bool {
            self.0[$bit]
        }

        ::paste::paste! {
            pub fn [<set_ $flag>](&mut self, value: bool) {
                self.0.set($bit, value);
            }

            #[allow(non_upper_case_globals)]
            pub const [<MASK_ $flag>]: u64 = crate::macros::range_mask($bit..$bit + 1);
        }
    };
}

/// Generate a mask of the specified flags.
macro_rules! mask_of {
    ($FlagT:ty: $($flag:ident),* $(,)*) => {
        ::paste::paste! {
            $(
                <$FlagT>::[<MASK_ $flag>]
            )|*
        }
    };
}

/// Generate a bit representation that puts the specified values at the given flags.
macro_rules! bit_repr_of {
    ($FlagT:ty: { $($flag:ident: $val:expr),* $(,)* }) => {
        ::paste::paste! {
            $(
                crate::macros::value_at_mask($val, <$FlagT>::[<MASK_ $flag>])
            )|*
        }
    };
}

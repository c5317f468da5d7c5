//! The user-callable runtime library and its signature table. The type
//! checker matches call sites against `RUNTIME_LIBRARY`; the code generator
//! marshals arguments from the evaluation stack according to the same
//! signatures and jumps to the recorded entry point.

use std::collections::BTreeMap;
use std::io::Write;

use once_cell::sync::Lazy;
use rand::Rng;

use super::{Array, ArrayItems, Runtime};
use crate::frontend::ast::{NUMBER, STRING, Type, TypeDescriptor};

/// A typed entry point; the variants cover the parameter shapes the library
/// actually uses, and `address` flattens them for the emitter.
#[derive(Debug, Clone, Copy)]
pub enum LibraryEntry {
    Aggregate(unsafe extern "C" fn(*const Array) -> f64),
    Math(unsafe extern "C" fn(f64) -> f64),
    Nullary(unsafe extern "C" fn() -> f64),
    StringToNumber(unsafe extern "C" fn(*const String) -> f64),
    Substring(unsafe extern "C" fn(*mut Runtime, *const String, f64) -> *mut String),
}

impl LibraryEntry {
    pub fn address(self) -> usize {
        match self {
            Self::Aggregate(f) => f as usize,
            Self::Math(f) => f as usize,
            Self::Nullary(f) => f as usize,
            Self::StringToNumber(f) => f as usize,
            Self::Substring(f) => f as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub entry: LibraryEntry,
    /// Dense library index (the `id_index` of a resolved call target).
    pub index: i32,
    pub return_type: TypeDescriptor,
    pub parameters: Vec<TypeDescriptor>,
}

const NUMBER_ARRAY: TypeDescriptor = TypeDescriptor::array(Type::Number, 1);

pub static RUNTIME_LIBRARY: Lazy<BTreeMap<&'static str, FunctionSignature>> = Lazy::new(|| {
    let aggregate = |f, index| FunctionSignature {
        entry: LibraryEntry::Aggregate(f),
        index,
        return_type: NUMBER,
        parameters: vec![NUMBER_ARRAY],
    };
    let math = |f, index| FunctionSignature {
        entry: LibraryEntry::Math(f),
        index,
        return_type: NUMBER,
        parameters: vec![NUMBER],
    };
    let substring = |f, index| FunctionSignature {
        entry: LibraryEntry::Substring(f),
        index,
        return_type: STRING,
        parameters: vec![STRING, NUMBER],
    };

    BTreeMap::from([
        ("stddev", aggregate(stddev, 0)),
        ("mean", aggregate(mean, 1)),
        ("count", aggregate(count, 2)),
        ("min", aggregate(min, 3)),
        ("max", aggregate(max, 4)),
        ("sin", math(sin, 5)),
        ("cos", math(cos, 6)),
        ("tan", math(tan, 7)),
        (
            "pi",
            FunctionSignature {
                entry: LibraryEntry::Nullary(pi),
                index: 8,
                return_type: NUMBER,
                parameters: Vec::new(),
            },
        ),
        ("atan", math(atan, 9)),
        ("asin", math(asin, 10)),
        ("acos", math(acos, 11)),
        ("exp", math(exp, 12)),
        ("ln", math(ln, 13)),
        (
            "print",
            FunctionSignature {
                entry: LibraryEntry::StringToNumber(print),
                index: 14,
                return_type: NUMBER,
                parameters: vec![STRING],
            },
        ),
        ("random", math(random, 15)),
        (
            "len",
            FunctionSignature {
                entry: LibraryEntry::StringToNumber(len),
                index: 16,
                return_type: NUMBER,
                parameters: vec![STRING],
            },
        ),
        ("right", substring(right, 17)),
        ("left", substring(left, 18)),
    ])
});

unsafe fn numbers<'a>(array: *const Array) -> &'a [f64] {
    match unsafe { &(*array).items } {
        ArrayItems::Number(items) => items,
        _ => &[],
    }
}

/// `sqrt(E[x^2] - E[x]^2)`; a zero-length sample yields 0.
pub unsafe extern "C" fn stddev(array: *const Array) -> f64 {
    let items = unsafe { numbers(array) };
    if items.is_empty() {
        return 0.0;
    }

    let len = items.len() as f64;
    let mean = items.iter().sum::<f64>() / len;
    let mean_of_squares = items.iter().map(|x| x * x).sum::<f64>() / len;

    (mean_of_squares - mean * mean).sqrt()
}

pub unsafe extern "C" fn mean(array: *const Array) -> f64 {
    let items = unsafe { numbers(array) };
    if items.is_empty() {
        return 0.0;
    }

    items.iter().sum::<f64>() / items.len() as f64
}

pub unsafe extern "C" fn count(array: *const Array) -> f64 {
    unsafe { numbers(array) }.len() as f64
}

pub unsafe extern "C" fn min(array: *const Array) -> f64 {
    let items = unsafe { numbers(array) };
    if items.is_empty() {
        return 0.0;
    }

    items.iter().copied().fold(f64::INFINITY, f64::min)
}

pub unsafe extern "C" fn max(array: *const Array) -> f64 {
    let items = unsafe { numbers(array) };
    if items.is_empty() {
        return 0.0;
    }

    items.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

pub unsafe extern "C" fn sin(number: f64) -> f64 {
    number.sin()
}

pub unsafe extern "C" fn cos(number: f64) -> f64 {
    number.cos()
}

pub unsafe extern "C" fn tan(number: f64) -> f64 {
    number.tan()
}

pub unsafe extern "C" fn pi() -> f64 {
    std::f64::consts::PI
}

pub unsafe extern "C" fn atan(number: f64) -> f64 {
    number.atan()
}

pub unsafe extern "C" fn asin(number: f64) -> f64 {
    number.asin()
}

pub unsafe extern "C" fn acos(number: f64) -> f64 {
    number.acos()
}

pub unsafe extern "C" fn exp(number: f64) -> f64 {
    number.exp()
}

pub unsafe extern "C" fn ln(number: f64) -> f64 {
    number.ln()
}

/// Writes the string to stdout (no trailing newline) and returns its length.
pub unsafe extern "C" fn print(string: *const String) -> f64 {
    let string = unsafe { &*string };
    print!("{string}");
    std::io::stdout().flush().ok();
    string.chars().count() as f64
}

/// Uniform in `[0, n)`; non-positive `n` yields 0.
pub unsafe extern "C" fn random(number: f64) -> f64 {
    if number <= 0.0 {
        return 0.0;
    }

    rand::thread_rng().gen_range(0.0..number)
}

pub unsafe extern "C" fn len(string: *const String) -> f64 {
    unsafe { (*string).chars().count() as f64 }
}

/// The last `n` characters (clamped to the string's length).
pub unsafe extern "C" fn right(
    runtime: *mut Runtime,
    string: *const String,
    n: f64,
) -> *mut String {
    let string = unsafe { &*string };
    let total = string.chars().count();
    let keep = (n.max(0.0) as usize).min(total);

    let result: String = string.chars().skip(total - keep).collect();
    unsafe { (*runtime).register_string(result) }
}

/// The first `n` characters (clamped to the string's length).
pub unsafe extern "C" fn left(
    runtime: *mut Runtime,
    string: *const String,
    n: f64,
) -> *mut String {
    let string = unsafe { &*string };
    let keep = (n.max(0.0) as usize).min(string.chars().count());

    let result: String = string.chars().take(keep).collect();
    unsafe { (*runtime).register_string(result) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::allocate_array;

    fn number_array(runtime: &mut Runtime, values: &[f64]) -> *mut Array {
        // Stack order: last value at the lowest address.
        let slots: Vec<u64> = values.iter().rev().map(|v| v.to_bits()).collect();
        unsafe { allocate_array(runtime, NUMBER.to_bits(), slots.len() as i64, slots.as_ptr()) }
    }

    #[test]
    fn signature_table_is_complete_and_densely_indexed() {
        assert_eq!(RUNTIME_LIBRARY.len(), 19);

        let mut indices: Vec<_> = RUNTIME_LIBRARY.values().map(|s| s.index).collect();
        indices.sort();
        assert_eq!(indices, (0..19).collect::<Vec<_>>());

        assert!(RUNTIME_LIBRARY["pi"].parameters.is_empty());
        assert_eq!(RUNTIME_LIBRARY["right"].return_type, STRING);
        assert_eq!(RUNTIME_LIBRARY["stddev"].parameters[0], NUMBER_ARRAY);
    }

    #[test]
    fn aggregates_over_samples() {
        let mut runtime = Runtime::default();
        let samples = number_array(&mut runtime, &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);

        unsafe {
            assert_eq!(mean(samples), 5.0);
            assert_eq!(stddev(samples), 2.0);
            assert_eq!(count(samples), 8.0);
            assert_eq!(min(samples), 2.0);
            assert_eq!(max(samples), 9.0);
        }
    }

    #[test]
    fn aggregates_of_nothing_are_zero() {
        let mut runtime = Runtime::default();
        let empty = number_array(&mut runtime, &[]);

        unsafe {
            assert_eq!(mean(empty), 0.0);
            assert_eq!(stddev(empty), 0.0);
            assert_eq!(count(empty), 0.0);
        }
    }

    #[test]
    fn substrings_clamp_out_of_range_counts() {
        let mut runtime = Runtime::default();
        let hello = runtime.register_string("hello".to_owned());

        unsafe {
            assert_eq!(&*right(&mut runtime, hello, 3.0), "llo");
            assert_eq!(&*left(&mut runtime, hello, 2.0), "he");
            assert_eq!(&*right(&mut runtime, hello, 99.0), "hello");
            assert_eq!(&*left(&mut runtime, hello, 99.0), "hello");
            assert_eq!(&*left(&mut runtime, hello, -1.0), "");
            assert_eq!(len(hello), 5.0);
        }
    }

    #[test]
    fn random_stays_in_range() {
        for _ in 0..100 {
            let value = unsafe { random(10.0) };
            assert!((0.0..10.0).contains(&value));
        }
        assert_eq!(unsafe { random(0.0) }, 0.0);
    }
}

//! The language runtime that generated code calls back into. Strings and
//! arrays allocated while a program runs are registered on the `Runtime` and
//! freed en masse by `post_exec_cleanup`; this is an arena discipline, so
//! values can be copied around the evaluation stack as plain 64-bit words
//! without any reference counting.
//!
//! Every `extern "C"` function here is an entry point for the generated
//! code; their signatures are part of the code generator's call-shim
//! contract and must stay in sync with it.

use crate::frontend::ast::{Type, TypeDescriptor};

pub mod library;

#[derive(Debug, Default)]
pub struct Runtime {
    strings: Vec<*mut String>,
    arrays: Vec<*mut Array>,
    /// In-band error flag; set by a failed array access and checked by the
    /// generated code after each one.
    pub exception: bool,
}

impl Runtime {
    pub fn register_string(&mut self, value: String) -> *mut String {
        let pointer = Box::into_raw(Box::new(value));
        self.strings.push(pointer);
        pointer
    }

    pub fn register_array(&mut self, value: Array) -> *mut Array {
        let pointer = Box::into_raw(Box::new(value));
        self.arrays.push(pointer);
        pointer
    }

    pub fn cleanup(&mut self) {
        for pointer in self.strings.drain(..) {
            drop(unsafe { Box::from_raw(pointer) });
        }
        for pointer in self.arrays.drain(..) {
            drop(unsafe { Box::from_raw(pointer) });
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// A runtime array. `item_type` describes the items, so a nested array of
/// dimension `n` stores items of dimension `n - 1`.
#[derive(Debug)]
pub struct Array {
    pub item_type: TypeDescriptor,
    pub items: ArrayItems,
}

#[derive(Debug)]
pub enum ArrayItems {
    Number(Vec<f64>),
    Boolean(Vec<bool>),
    Str(Vec<*mut String>),
    Array(Vec<*mut Array>),
}

impl Array {
    pub fn len(&self) -> usize {
        match &self.items {
            ArrayItems::Number(items) => items.len(),
            ArrayItems::Boolean(items) => items.len(),
            ArrayItems::Str(items) => items.len(),
            ArrayItems::Array(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sub-op 0. Builds an array from `len` evaluation-stack slots starting at
/// `base` (the stack pointer, so `base[0]` holds the *last* item) and
/// registers it with the runtime.
///
/// # Safety
/// `runtime` must be the live runtime instance and `base` must point at
/// `len` readable 8-byte slots.
pub unsafe extern "C" fn allocate_array(
    runtime: *mut Runtime,
    item_type: u64,
    len: i64,
    base: *const u64,
) -> *mut Array {
    let runtime = unsafe { &mut *runtime };
    let item_type = TypeDescriptor::from_bits(item_type);
    let slots = if len <= 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(base, len as usize) }
    };

    let items = if item_type.is_array() {
        ArrayItems::Array(slots.iter().rev().map(|&bits| bits as *mut Array).collect())
    } else {
        match item_type.base {
            Type::Boolean => ArrayItems::Boolean(slots.iter().rev().map(|&bits| bits != 0).collect()),
            Type::String => ArrayItems::Str(slots.iter().rev().map(|&bits| bits as *mut String).collect()),
            // Numbers, and the item type of an empty literal.
            _ => ArrayItems::Number(slots.iter().rev().map(|&bits| f64::from_bits(bits)).collect()),
        }
    };

    runtime.register_array(Array { item_type, items })
}

/// Sub-op 1. Indexes an array; an out-of-range index raises the runtime's
/// exception flag and yields 0.
///
/// # Safety
/// `runtime` and `array` must be live pointers from this runtime.
pub unsafe extern "C" fn array_element(
    runtime: *mut Runtime,
    array: *const Array,
    index: i64,
) -> u64 {
    let runtime = unsafe { &mut *runtime };
    let array = unsafe { &*array };

    runtime.exception = index < 0 || index >= array.len() as i64;
    if runtime.exception {
        return 0;
    }

    let index = index as usize;
    match &array.items {
        ArrayItems::Number(items) => items[index].to_bits(),
        ArrayItems::Boolean(items) => items[index] as u64,
        ArrayItems::Str(items) => items[index] as u64,
        ArrayItems::Array(items) => items[index] as u64,
    }
}

/// Sub-op 2. Appends one value (as its stack word) and returns the array,
/// which is shared, not copied.
///
/// # Safety
/// `array` must be a live array pointer; `value` must be a word of the
/// array's item type.
pub unsafe extern "C" fn append_element(array: *mut Array, value: u64) -> *mut Array {
    match &mut unsafe { &mut *array }.items {
        ArrayItems::Number(items) => items.push(f64::from_bits(value)),
        ArrayItems::Boolean(items) => items.push(value != 0),
        ArrayItems::Str(items) => items.push(value as *mut String),
        ArrayItems::Array(items) => items.push(value as *mut Array),
    }

    array
}

/// Sub-op 3. Materialises a string literal into the arena.
///
/// # Safety
/// `literal` must point at a `String` that outlives the running code.
pub unsafe extern "C" fn allocate_string(
    runtime: *mut Runtime,
    literal: *const String,
) -> *mut String {
    unsafe { (*runtime).register_string((*literal).clone()) }
}

/// Sub-op 4. String concatenation.
///
/// # Safety
/// All pointers must be live.
pub unsafe extern "C" fn cat_string(
    runtime: *mut Runtime,
    first: *const String,
    second: *const String,
) -> *mut String {
    unsafe { (*runtime).register_string(format!("{}{}", &*first, &*second)) }
}

/// Sub-op 5. Number-to-string coercion; fixed-point with six decimals to
/// match the compile-time folding.
///
/// # Safety
/// `runtime` must be live.
pub unsafe extern "C" fn number_to_string(runtime: *mut Runtime, number: f64) -> *mut String {
    unsafe { (*runtime).register_string(format!("{number:.6}")) }
}

/// Sub-op 6. Lexicographic string comparison; `kind` selects eq, ne, gt,
/// lt, ge, le (0..5).
///
/// # Safety
/// Both strings must be live.
pub unsafe extern "C" fn string_compare(
    first: *const String,
    second: *const String,
    kind: i64,
) -> i64 {
    let ordering = unsafe { (*first).cmp(&*second) };

    let result = match kind {
        0 => ordering.is_eq(),
        1 => ordering.is_ne(),
        2 => ordering.is_gt(),
        3 => ordering.is_lt(),
        4 => ordering.is_ge(),
        5 => ordering.is_le(),
        _ => false,
    };

    result as i64
}

/// Sub-op 7. Structural array equality.
///
/// # Safety
/// Both arrays (and everything they reference) must be live.
pub unsafe extern "C" fn array_compare(first: *const Array, second: *const Array) -> i64 {
    unsafe { arrays_equal(&*first, &*second) as i64 }
}

unsafe fn arrays_equal(first: &Array, second: &Array) -> bool {
    match (&first.items, &second.items) {
        (ArrayItems::Number(a), ArrayItems::Number(b)) => a == b,
        (ArrayItems::Boolean(a), ArrayItems::Boolean(b)) => a == b,
        (ArrayItems::Str(a), ArrayItems::Str(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|(&x, &y)| unsafe { *x == *y })
        }
        (ArrayItems::Array(a), ArrayItems::Array(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|(&x, &y)| unsafe { arrays_equal(&*x, &*y) })
        }
        _ => false,
    }
}

/// Sub-op 8. Frees every string and array the run allocated; the epilogue
/// and the exception unwind path both end here.
///
/// # Safety
/// `runtime` must be live; no arena pointer may be used afterwards.
pub unsafe extern "C" fn post_exec_cleanup(runtime: *mut Runtime) -> i64 {
    unsafe { (*runtime).cleanup() };
    true as i64
}

/// Read the in-band error flag (checked after every array access).
///
/// # Safety
/// `runtime` must be live.
pub unsafe extern "C" fn check_exception(runtime: *mut Runtime) -> i64 {
    unsafe { (*runtime).exception as i64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::NUMBER;

    #[test]
    fn allocate_reads_stack_order() {
        let mut runtime = Runtime::default();
        // The stack pointer sees the last item first.
        let slots = [3.0f64.to_bits(), 2.0f64.to_bits(), 1.0f64.to_bits()];

        let array = unsafe {
            allocate_array(&mut runtime, NUMBER.to_bits(), 3, slots.as_ptr())
        };

        let ArrayItems::Number(items) = &unsafe { &*array }.items else {
            panic!("expected a number array");
        };
        assert_eq!(items, &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn out_of_bounds_raises_the_exception_flag() {
        let mut runtime = Runtime::default();
        let slots = [1.0f64.to_bits()];
        let array = unsafe { allocate_array(&mut runtime, NUMBER.to_bits(), 1, slots.as_ptr()) };

        let value = unsafe { array_element(&mut runtime, array, 0) };
        assert!(!runtime.exception);
        assert_eq!(f64::from_bits(value), 1.0);

        unsafe { array_element(&mut runtime, array, 10) };
        assert!(runtime.exception);
        unsafe { array_element(&mut runtime, array, -1) };
        assert!(runtime.exception);
    }

    #[test]
    fn append_shares_the_array() {
        let mut runtime = Runtime::default();
        let array = unsafe { allocate_array(&mut runtime, NUMBER.to_bits(), 0, std::ptr::null()) };

        let appended = unsafe { append_element(array, 4.0f64.to_bits()) };
        assert_eq!(appended, array);
        assert_eq!(unsafe { &*array }.len(), 1);
    }

    #[test]
    fn string_comparison_kinds() {
        let mut runtime = Runtime::default();
        let a = runtime.register_string("alpha".to_owned());
        let b = runtime.register_string("beta".to_owned());

        // 0 eq, 1 ne, 2 gt, 3 lt, 4 ge, 5 le
        assert_eq!(unsafe { string_compare(a, b, 0) }, 0);
        assert_eq!(unsafe { string_compare(a, b, 1) }, 1);
        assert_eq!(unsafe { string_compare(a, b, 2) }, 0);
        assert_eq!(unsafe { string_compare(a, b, 3) }, 1);
        assert_eq!(unsafe { string_compare(a, a, 4) }, 1);
        assert_eq!(unsafe { string_compare(a, b, 5) }, 1);
    }

    #[test]
    fn structural_equality_descends_into_items() {
        let mut runtime = Runtime::default();

        let first = {
            let inner = [2.0f64.to_bits(), 1.0f64.to_bits()];
            unsafe { allocate_array(&mut runtime, NUMBER.to_bits(), 2, inner.as_ptr()) }
        };
        let second = {
            let inner = [2.0f64.to_bits(), 1.0f64.to_bits()];
            unsafe { allocate_array(&mut runtime, NUMBER.to_bits(), 2, inner.as_ptr()) }
        };
        assert_eq!(unsafe { array_compare(first, second) }, 1);

        unsafe { append_element(second, 9.0f64.to_bits()) };
        assert_eq!(unsafe { array_compare(first, second) }, 0);
    }

    #[test]
    fn cleanup_empties_the_arena() {
        let mut runtime = Runtime::default();
        runtime.register_string("transient".to_owned());
        let slots = [1.0f64.to_bits()];
        unsafe { allocate_array(&mut runtime, NUMBER.to_bits(), 1, slots.as_ptr()) };

        unsafe { post_exec_cleanup(&mut runtime) };
        assert!(runtime.strings.is_empty());
        assert!(runtime.arrays.is_empty());
    }

    #[test]
    fn number_rendering_matches_fold_time_rendering() {
        let mut runtime = Runtime::default();
        let rendered = unsafe { number_to_string(&mut runtime, 5.0) };
        assert_eq!(unsafe { &*rendered }, "5.000000");
    }
}

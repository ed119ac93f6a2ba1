//! Runtime support routines, written in three-address code. They are
//! ordinary functions to every later stage and are only kept when some
//! reachable code refers to them.

use indoc::formatdoc;
use log::debug;

use crate::{
    error::CompileResult,
    middle::tac::{Function, StringLiteral, parser::parse_functions},
};

pub const MY_MALLOC: &str = "my_malloc";
pub const MY_FREE: &str = "my_free";
pub const VERIFY_NO_LEAKS: &str = "verify_no_leaks";
pub const FREE_GLOBALS: &str = "free_globals";

/// Global holding the head of the allocator's block list
pub const FIRST_BLOCK: &str = "first_block";

/// Routines user code can call by name
pub const BUILTINS: &[&str] = &["length", "print", "readInt", "startsWith"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MallocImplementation {
    Sbrk,
    Mmap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintImplementation {
    /// The kernel prints a NUL-terminated string
    PrintSyscall,
    /// Measure the string, then write it to stdout
    WriteSyscall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadIntImplementation {
    ReadIntSyscall,
    /// Read a line from stdin and parse it
    ReadSyscall,
}

/// The part of a target description the target-agnostic stages need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSupport {
    pub word_size: usize,
    pub malloc: MallocImplementation,
    pub print: PrintImplementation,
    pub read_int: ReadIntImplementation,
}

impl RuntimeSupport {
    pub fn sbrk_and_print(word_size: usize) -> Self {
        Self {
            word_size,
            malloc: MallocImplementation::Sbrk,
            print: PrintImplementation::PrintSyscall,
            read_int: ReadIntImplementation::ReadIntSyscall,
        }
    }

    pub fn mmap_and_write(word_size: usize) -> Self {
        Self {
            word_size,
            malloc: MallocImplementation::Mmap,
            print: PrintImplementation::WriteSyscall,
            read_int: ReadIntImplementation::ReadSyscall,
        }
    }
}

pub fn error_strings() -> Vec<StringLiteral> {
    [
        ("tried_to_free_null", "Tried to free null pointer! Exiting."),
        ("double_free_error", "Double free detected! Exiting."),
        ("sbrk_failed", "Memory allocation failed! Exiting."),
        ("leaks_found_error", "Leaks detected! Exiting."),
        ("zero_memory_malloc_error", "Zero memory requested! Exiting."),
    ]
    .into_iter()
    .map(|(name, value)| StringLiteral {
        name: name.into(),
        value: value.into(),
    })
    .collect()
}

fn string_routines() -> String {
    formatdoc! {"
        (function) length(r:string):
            r:pointer = r:string
            r:length = 0
            length_loop:
            r:char = *r:pointer
            goto length_done if r:char == 0
            r:length++
            r:pointer++
            goto length_loop
            length_done:
            return r:length

        (function) string_copy(r:source, r:destination):
            r:from = r:source
            r:to = r:destination
            string_copy_loop:
            r:char = *r:from
            *r:to = r:char
            goto string_copy_done if r:char == 0
            r:from++
            r:to++
            goto string_copy_loop
            string_copy_done:

        (function) string_concatenate(r:lhs, r:rhs, r:destination):
            r:to = r:destination
            r:from = r:lhs
            string_concatenate_lhs_loop:
            r:char = *r:from
            goto string_concatenate_rhs if r:char == 0
            *r:to = r:char
            r:from++
            r:to++
            goto string_concatenate_lhs_loop
            string_concatenate_rhs:
            r:from = r:rhs
            string_concatenate_rhs_loop:
            r:char = *r:from
            *r:to = r:char
            goto string_concatenate_done if r:char == 0
            r:from++
            r:to++
            goto string_concatenate_rhs_loop
            string_concatenate_done:

        (function) string_equality(r:lhs, r:rhs):
            r:left = r:lhs
            r:right = r:rhs
            string_equality_loop:
            r:a = *r:left
            r:b = *r:right
            goto string_equality_different if r:a != r:b
            goto string_equality_same if r:a == 0
            r:left++
            r:right++
            goto string_equality_loop
            string_equality_same:
            r:result = 1
            return r:result
            string_equality_different:
            r:result = 0
            return r:result

        (function) startsWith(r:haystack, r:needle):
            r:h = r:haystack
            r:n = r:needle
            startsWith_loop:
            r:expected = *r:n
            goto startsWith_yes if r:expected == 0
            r:actual = *r:h
            goto startsWith_no if r:actual != r:expected
            r:h++
            r:n++
            goto startsWith_loop
            startsWith_yes:
            r:result = 1
            return r:result
            startsWith_no:
            r:result = 0
            return r:result

        (function) intFromString(r:string):
            r:pointer = r:string
            r:result = 0
            r:ten = 10
            r:zeroChar = 48
            r:nineChar = 57
            r:minusChar = 45
            r:negative = 0
            r:first = *r:pointer
            goto intFromString_loop if r:first != r:minusChar
            r:negative = 1
            r:pointer++
            intFromString_loop:
            r:char = *r:pointer
            goto intFromString_done if r:zeroChar > r:char
            goto intFromString_done if r:char > r:nineChar
            r:digit = r:char - r:zeroChar
            r:scaled = r:result * r:ten
            r:result = r:scaled + r:digit
            r:pointer++
            goto intFromString_loop
            intFromString_done:
            goto intFromString_return if r:negative == 0
            r:zero = 0
            r:result = r:zero - r:result; negate
            intFromString_return:
            return r:result
    "}
}

fn memory_routines(word_size: usize) -> String {
    let (next, free, header) = (word_size, 2 * word_size, 3 * word_size);

    formatdoc! {"
        (function) my_free(r:pointer):
            r:zero = 0
            goto my_free_not_null if r:pointer != r:zero
            r:message = &tried_to_free_null
            print(r:message)
            syscall exit -1
            my_free_not_null:
            r:header = {header}
            r:block = r:pointer - r:header; step back to the block header
            r:free = *(r:block + {free})
            goto my_free_not_double_free if r:free == 0
            r:doubleFreeMessage = &double_free_error
            print(r:doubleFreeMessage)
            syscall exit -1
            my_free_not_double_free:
            r:one = 1
            *(r:block + {free}) = r:one; mark block free

        (function) verify_no_leaks():
            r:block = *first_block
            r:one = 1
            verify_no_leaks_loop:
            goto verify_no_leaks_done if r:block == 0
            r:free = *(r:block + {free})
            goto verify_no_leaks_next if r:free == r:one
            r:message = &leaks_found_error
            print(r:message)
            syscall exit -1
            verify_no_leaks_next:
            r:block = *(r:block + {next})
            goto verify_no_leaks_loop
            verify_no_leaks_done:
    "}
}

fn malloc(word_size: usize, implementation: MallocImplementation) -> String {
    let (next, free, header) = (word_size, 2 * word_size, 3 * word_size);

    let grow = match implementation {
        MallocImplementation::Sbrk => "r:block = syscall sbrk r:blockBytes".to_owned(),
        // PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS
        MallocImplementation::Mmap => "r:block = syscall mmap 0 r:blockBytes 3 34 -1 0".to_owned(),
    };

    formatdoc! {"
        (function) my_malloc(r:bytes):
            r:zero = 0
            goto my_malloc_size_ok if r:bytes > r:zero
            r:message = &zero_memory_malloc_error
            print(r:message)
            syscall exit -1
            my_malloc_size_ok:
            r:previous = 0
            r:current = *first_block
            my_malloc_search:
            goto my_malloc_grow if r:current == 0
            r:free = *(r:current + {free})
            goto my_malloc_next if r:free == 0
            r:size = *(r:current + 0)
            goto my_malloc_next if r:bytes > r:size
            *(r:current + {free}) = 0; reuse a free block
            r:current += {header}
            return r:current
            my_malloc_next:
            r:previous = r:current
            r:current = *(r:current + {next})
            goto my_malloc_search
            my_malloc_grow:
            r:blockBytes = r:bytes
            r:blockBytes += {header}
            {grow}
            r:failed = -1
            goto my_malloc_grew if r:block != r:failed
            r:failedMessage = &sbrk_failed
            print(r:failedMessage)
            syscall exit -1
            my_malloc_grew:
            goto my_malloc_link if r:previous != r:zero
            *first_block = r:block; first block ever
            goto my_malloc_initialize
            my_malloc_link:
            *(r:previous + {next}) = r:block; append to the block list
            my_malloc_initialize:
            *(r:block + 0) = r:bytes
            *(r:block + {next}) = 0
            *(r:block + {free}) = 0
            r:block += {header}
            return r:block
    "}
}

fn print(implementation: PrintImplementation) -> String {
    match implementation {
        PrintImplementation::PrintSyscall => formatdoc! {"
            (function) print(r:string):
                r:result = syscall print r:string
                return r:result
        "},
        PrintImplementation::WriteSyscall => formatdoc! {"
            (function) print(r:string):
                r:length = length(r:string)
                r:result = syscall write 1 r:string r:length; write to stdout
                return r:result
        "},
    }
}

fn read_int(implementation: ReadIntImplementation) -> String {
    match implementation {
        ReadIntImplementation::ReadIntSyscall => formatdoc! {"
            (function) readInt():
                r:result = syscall readInt
                return r:result
        "},
        ReadIntImplementation::ReadSyscall => formatdoc! {"
            (function) readInt():
                r:bufferSize = 10
                r:allocation = r:bufferSize
                r:allocation++
                r:buffer = my_malloc(r:allocation)
                r:read = syscall read 0 r:buffer r:bufferSize
                r:zero = 0
                goto readInt_parse if r:read > r:zero
                r:read = 0; nothing read
                readInt_parse:
                r:end = r:buffer + r:read
                *r:end = r:zero; terminate what was read
                r:result = intFromString(r:buffer)
                my_free(r:buffer)
                return r:result
        "},
    }
}

/// The target-independent routines for a machine with `word_size` byte
/// words
pub fn generate(word_size: usize) -> CompileResult<Vec<Function>> {
    let mut functions = parse_functions(&string_routines())?;
    functions.extend(parse_functions(&memory_routines(word_size))?);
    Ok(functions)
}

/// Every runtime routine, with the target's own allocation and I/O
/// implementations
pub fn library(support: &RuntimeSupport) -> CompileResult<Vec<Function>> {
    let mut functions = generate(support.word_size)?;
    functions.extend(parse_functions(&malloc(support.word_size, support.malloc))?);
    functions.extend(parse_functions(&print(support.print))?);
    functions.extend(parse_functions(&read_int(support.read_int))?);

    debug!("runtime library has {} functions", functions.len());

    Ok(functions)
}

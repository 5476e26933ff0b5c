//! Pure lookups over the fixed record header fields.

use dioshark_protocol::{
    ACTION_ABORT, ACTION_BACKMERGE, ACTION_BOUNCE, ACTION_COMPLETE, ACTION_DRV_DATA,
    ACTION_FRONTMERGE, ACTION_GETRQ, ACTION_INSERT, ACTION_ISSUE, ACTION_PLUG, ACTION_QUEUE,
    ACTION_REMAP, ACTION_REQUEUE, ACTION_SLEEPRQ, ACTION_SPLIT, ACTION_UNPLUG_IO,
    ACTION_UNPLUG_TIMER, CATEGORY_DISCARD, CATEGORY_FLUSH, CATEGORY_FUA, CATEGORY_READ,
    CATEGORY_SYNC, CATEGORY_WRITE,
};

/// Short name of an action code (low 16 bits of the record's action).
///
/// Returns `"?"` for unknown codes.  The letters follow the usual
/// blkparse convention (Q = queued, D = issued to driver, C = completed...).
pub fn action_name(action: u16) -> &'static str {
    let result = match action {
        ACTION_QUEUE => "Q",
        ACTION_BACKMERGE => "M",
        ACTION_FRONTMERGE => "F",
        ACTION_GETRQ => "G",
        ACTION_SLEEPRQ => "S",
        ACTION_REQUEUE => "R",
        ACTION_ISSUE => "D",
        ACTION_COMPLETE => "C",
        ACTION_PLUG => "P",
        ACTION_UNPLUG_IO => "U",
        ACTION_UNPLUG_TIMER => "UT",
        ACTION_INSERT => "I",
        ACTION_SPLIT => "X",
        ACTION_BOUNCE => "B",
        ACTION_REMAP => "A",
        ACTION_ABORT => "AB",
        ACTION_DRV_DATA => "DD",
        _ => "?",
    };

    debug_assert!(!result.is_empty(), "action_name returned empty string");

    result
}

/// Operation flags of a category mask, as in blkparse's RWBS column.
///
/// Direction comes first (`D` discard, `W` write, `R` read, `N` none),
/// followed by `F` (FUA/flush) and `S` (sync) modifiers.
pub fn rwbs(category: u16) -> String {
    let mut out = String::with_capacity(4);
    if category & CATEGORY_FLUSH != 0 {
        out.push('F');
    }
    if category & CATEGORY_DISCARD != 0 {
        out.push('D');
    } else if category & CATEGORY_WRITE != 0 {
        out.push('W');
    } else if category & CATEGORY_READ != 0 {
        out.push('R');
    } else {
        out.push('N');
    }
    if category & CATEGORY_FUA != 0 {
        out.push('F');
    }
    if category & CATEGORY_SYNC != 0 {
        out.push('S');
    }

    debug_assert!(!out.is_empty());

    out
}

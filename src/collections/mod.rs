// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod bytes;
mod heap;

pub use self::bytes::ByteBuffer;
pub use self::heap::IndexedHeap;

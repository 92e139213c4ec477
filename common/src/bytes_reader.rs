//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use thiserror::Error;

/// A cursor over borrowed bytes whose reads never go past the end of the input.
///
/// Every read either consumes exactly the requested bytes or fails with
/// [`ReadError::End`], so the remaining length acts as a running budget that
/// no length-prefixed field can exceed.
#[derive(Clone)]
pub struct BytesReader<'a> {
    data: &'a [u8],
}

impl<'a> BytesReader<'a> {
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Self { data: slice }
    }

    pub fn read_u8(&mut self) -> ReadResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Gets the next `n` bytes from the stream.
    ///
    /// If there are not at least `n` bytes remaining it reads them all and returns the Error `End`.
    pub fn read_bytes(&mut self, n: usize) -> ReadResult<&'a [u8]> {
        if self.data.len() < n {
            self.data = &self.data[self.data.len()..];
            return Err(ReadError::End);
        }
        let (result, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(result)
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn read_u32_be(&mut self) -> ReadResult<u32> {
        let bytes = self.read_bytes(4)?;
        let array: [u8; 4] = bytes.try_into().map_err(|_| ReadError::End)?;
        Ok(u32::from_be_bytes(array))
    }
}

pub type ReadResult<T> = Result<T, ReadError>;

#[derive(Error, Eq, PartialEq, Debug, Copy, Clone)]
pub enum ReadError {
    #[error("Reached end of stream")]
    End,
}

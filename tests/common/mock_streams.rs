//! Mock streams that fragment reads and writes to exercise frame reassembly

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Returns predetermined read sizes, then the rest, then EOF
pub struct ControlledMockStream {
    data: Vec<u8>,
    position: usize,
    read_sizes: Vec<usize>, // Sizes for successive read operations
    read_count: usize,
}

impl ControlledMockStream {
    pub fn new(data: Vec<u8>, read_sizes: Vec<usize>) -> Self {
        Self {
            data,
            position: 0,
            read_sizes,
            read_count: 0,
        }
    }

    /// Deliver the data one byte per read
    pub fn byte_by_byte(data: Vec<u8>) -> Self {
        let sizes = vec![1; data.len()];
        Self::new(data, sizes)
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.data.len()
    }

    pub fn read_count(&self) -> usize {
        self.read_count
    }
}

impl AsyncRead for ControlledMockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.position >= self.data.len() {
            return Poll::Ready(Ok(()));
        }

        let read_size = match self.read_sizes.get(self.read_count) {
            Some(size) => *size,
            None => self.data.len() - self.position,
        };

        let remaining_data = self.data.len() - self.position;
        let bytes_to_read = read_size.min(buf.remaining()).min(remaining_data);
        if bytes_to_read > 0 {
            let end = self.position + bytes_to_read;
            buf.put_slice(&self.data[self.position..end]);
            self.position = end;
        }

        self.read_count += 1;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ControlledMockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Accepts predetermined write sizes to simulate backpressure
pub struct ControlledWriteMockStream {
    written_data: Vec<u8>,
    write_sizes: Vec<usize>,
    write_count: usize,
}

impl ControlledWriteMockStream {
    pub fn new(write_sizes: Vec<usize>) -> Self {
        Self {
            written_data: Vec::new(),
            write_sizes,
            write_count: 0,
        }
    }

    pub fn get_written_data(&self) -> &[u8] {
        &self.written_data
    }

    pub fn write_operation_count(&self) -> usize {
        self.write_count
    }
}

impl AsyncWrite for ControlledWriteMockStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let accepted = match self.write_sizes.get(self.write_count) {
            Some(size) => (*size).min(buf.len()),
            None => buf.len(),
        };
        self.written_data.extend_from_slice(&buf[..accepted]);
        self.write_count += 1;
        Poll::Ready(Ok(accepted))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }
}

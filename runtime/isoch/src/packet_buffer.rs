// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Lock-free buffer of packets between the realtime context and the consumer.
//!
//! The buffer is divided into fixed-size slots. Each slot has the length of payload, the header,
//! and the payload. The producer commits whole slot at once, thus the consumer never observes
//! partial packet.
//!
//! ```text
//! +--------+------------------+--------------------------------+
//! | len(4) | header(N)        | payload(up to max_payload)      |
//! +--------+------------------+--------------------------------+
//! ```

use {
    firewire_isoch_protocols::IsochStreamError,
    glib::{Error, FileError},
    rtrb::{Consumer, Producer, RingBuffer},
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const LENGTH_FIELD_SIZE: usize = 4;

#[derive(Debug)]
struct Shared {
    header_size: usize,
    max_payload: usize,
    stride: usize,
    capacity: usize,
    payload_fill: AtomicUsize,
}

/// The constructor of lock-free buffer of packets.
pub struct PacketBuffer;

impl PacketBuffer {
    /// Allocate the buffer for the number of packets, then split it to producer and consumer.
    pub fn new(
        header_size: usize,
        capacity: usize,
        max_payload: usize,
    ) -> Result<(PacketProducer, PacketConsumer), Error> {
        if capacity == 0 || max_payload == 0 {
            let msg = format!(
                "Invalid size of packet buffer: capacity {}, max payload {}",
                capacity, max_payload
            );
            Err(Error::new(FileError::Inval, &msg))?;
        }

        let stride = LENGTH_FIELD_SIZE
            .checked_add(header_size)
            .and_then(|size| size.checked_add(max_payload))
            .filter(|&size| size <= u32::MAX as usize)
            .ok_or_else(|| Error::new(FileError::Inval, "Packet size overflows"))?;
        let size = stride
            .checked_mul(capacity)
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or_else(|| Error::new(FileError::Nomem, "Packet buffer size overflows"))?;

        let shared = Arc::new(Shared {
            header_size,
            max_payload,
            stride,
            capacity,
            payload_fill: Default::default(),
        });

        let (producer, consumer) = RingBuffer::<u8>::new(size);

        Ok((
            PacketProducer {
                ring: producer,
                shared: shared.clone(),
            },
            PacketConsumer {
                ring: consumer,
                shared,
            },
        ))
    }
}

fn copy_into(first: &mut [u8], second: &mut [u8], pos: usize, src: &[u8]) {
    if pos < first.len() {
        let count = (first.len() - pos).min(src.len());
        first[pos..(pos + count)].copy_from_slice(&src[..count]);
        let rest = &src[count..];
        second[..rest.len()].copy_from_slice(rest);
    } else {
        let pos = pos - first.len();
        second[pos..(pos + src.len())].copy_from_slice(src);
    }
}

fn clear_into(first: &mut [u8], second: &mut [u8], pos: usize, len: usize) {
    first
        .iter_mut()
        .chain(second.iter_mut())
        .skip(pos)
        .take(len)
        .for_each(|b| *b = 0);
}

fn copy_from(first: &[u8], second: &[u8], pos: usize, dst: &mut [u8]) {
    if pos < first.len() {
        let count = (first.len() - pos).min(dst.len());
        dst[..count].copy_from_slice(&first[pos..(pos + count)]);
        let rest = dst.len() - count;
        dst[count..].copy_from_slice(&second[..rest]);
    } else {
        let pos = pos - first.len();
        dst.copy_from_slice(&second[pos..(pos + dst.len())]);
    }
}

/// The producer side, used in the realtime context for receive stream or in the consumer
/// thread for transmit stream.
pub struct PacketProducer {
    ring: Producer<u8>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PacketProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PacketProducer")
            .field("shared", &self.shared)
            .field("fill", &self.get_buffer_fill_packets())
            .finish()
    }
}

impl PacketProducer {
    /// Queue one packet. The packet is queued wholly or not at all. Never blocks. The header
    /// shorter than the size of header is padded with zero.
    pub fn add_packet(&mut self, header: &[u8], payload: &[u8]) -> Result<(), IsochStreamError> {
        let shared = &self.shared;
        if header.len() > shared.header_size || payload.len() > shared.max_payload {
            Err(IsochStreamError::TooLarge)?;
        }

        let mut chunk = self
            .ring
            .write_chunk(shared.stride)
            .map_err(|_| IsochStreamError::Overflow)?;

        let (first, second) = chunk.as_mut_slices();
        copy_into(first, second, 0, &(payload.len() as u32).to_le_bytes());
        copy_into(first, second, LENGTH_FIELD_SIZE, header);
        // The rest of short header is zero, not the one of packet queued before.
        clear_into(
            first,
            second,
            LENGTH_FIELD_SIZE + header.len(),
            shared.header_size - header.len(),
        );
        copy_into(
            first,
            second,
            LENGTH_FIELD_SIZE + shared.header_size,
            payload,
        );

        // Count before publishing so that the consumer never subtracts more than added.
        shared
            .payload_fill
            .fetch_add(payload.len(), Ordering::Relaxed);
        chunk.commit_all();

        Ok(())
    }

    /// The number of packets in the buffer.
    pub fn get_buffer_fill_packets(&self) -> usize {
        let free = self.ring.slots() / self.shared.stride;
        self.shared.capacity - free
    }

    /// The total bytes of payload in the buffer.
    pub fn get_buffer_fill_payload(&self) -> usize {
        self.shared.payload_fill.load(Ordering::Relaxed)
    }

    /// The number of packets which can be queued.
    pub fn free_packets(&self) -> usize {
        self.ring.slots() / self.shared.stride
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn header_size(&self) -> usize {
        self.shared.header_size
    }

    pub fn max_payload(&self) -> usize {
        self.shared.max_payload
    }

    /// Whether the consumer is released.
    pub fn is_abandoned(&self) -> bool {
        self.ring.is_abandoned()
    }
}

/// The consumer side.
pub struct PacketConsumer {
    ring: Consumer<u8>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PacketConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PacketConsumer")
            .field("shared", &self.shared)
            .field("fill", &self.get_buffer_fill_packets())
            .finish()
    }
}

impl PacketConsumer {
    /// Dequeue the oldest packet into the header and payload, then return the length of
    /// payload. The destination shorter than the packet results in error and the packet is left
    /// in the buffer.
    pub fn get_next_packet(
        &mut self,
        header: &mut [u8],
        payload: &mut [u8],
    ) -> Result<usize, IsochStreamError> {
        let shared = &self.shared;
        let chunk = self
            .ring
            .read_chunk(shared.stride)
            .map_err(|_| IsochStreamError::Underflow)?;

        let (first, second) = chunk.as_slices();
        let mut field = [0; LENGTH_FIELD_SIZE];
        copy_from(first, second, 0, &mut field);
        let len = u32::from_le_bytes(field) as usize;

        if header.len() < shared.header_size || payload.len() < len {
            Err(IsochStreamError::TooLarge)?;
        }

        copy_from(
            first,
            second,
            LENGTH_FIELD_SIZE,
            &mut header[..shared.header_size],
        );
        copy_from(
            first,
            second,
            LENGTH_FIELD_SIZE + shared.header_size,
            &mut payload[..len],
        );

        chunk.commit_all();
        shared.payload_fill.fetch_sub(len, Ordering::Relaxed);

        Ok(len)
    }

    /// Discard the oldest packet, then return the length of its payload.
    pub fn skip_packet(&mut self) -> Result<usize, IsochStreamError> {
        let shared = &self.shared;
        let chunk = self
            .ring
            .read_chunk(shared.stride)
            .map_err(|_| IsochStreamError::Underflow)?;

        let (first, second) = chunk.as_slices();
        let mut field = [0; LENGTH_FIELD_SIZE];
        copy_from(first, second, 0, &mut field);
        let len = u32::from_le_bytes(field) as usize;

        chunk.commit_all();
        shared.payload_fill.fetch_sub(len, Ordering::Relaxed);

        Ok(len)
    }

    /// The number of packets in the buffer.
    pub fn get_buffer_fill_packets(&self) -> usize {
        self.ring.slots() / self.shared.stride
    }

    /// The total bytes of payload in the buffer.
    pub fn get_buffer_fill_payload(&self) -> usize {
        self.shared.payload_fill.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn header_size(&self) -> usize {
        self.shared.header_size
    }

    pub fn max_payload(&self) -> usize {
        self.shared.max_payload
    }

    /// Whether the producer is released.
    pub fn is_abandoned(&self) -> bool {
        self.ring.is_abandoned()
    }
}

#[cfg(test)]
mod test {
    use {super::*, std::thread};

    #[test]
    fn packet_buffer_construction() {
        assert!(PacketBuffer::new(8, 0, 32).is_err());
        assert!(PacketBuffer::new(8, 16, 0).is_err());
        assert!(PacketBuffer::new(8, usize::MAX, 32).is_err());

        let (producer, consumer) = PacketBuffer::new(8, 16, 32).unwrap();
        assert_eq!(producer.capacity(), 16);
        assert_eq!(producer.free_packets(), 16);
        assert_eq!(consumer.get_buffer_fill_packets(), 0);
        assert_eq!(consumer.max_payload(), 32);
    }

    #[test]
    fn packet_buffer_fifo() {
        let (mut producer, mut consumer) = PacketBuffer::new(4, 4, 16).unwrap();

        // Exercise the wrap around of underlying ring several times.
        (0..10u8).for_each(|i| {
            let payload: Vec<u8> = (0..(i as usize % 16 + 1)).map(|v| v as u8 + i).collect();
            producer.add_packet(&[i, 0, 0, i], &payload).unwrap();
            producer.add_packet(&[i, 1, 1, i], &payload[..1]).unwrap();
            assert_eq!(consumer.get_buffer_fill_packets(), 2);
            assert_eq!(producer.get_buffer_fill_payload(), payload.len() + 1);

            let mut header = [0; 4];
            let mut buf = [0; 16];
            let len = consumer.get_next_packet(&mut header, &mut buf).unwrap();
            assert_eq!(header, [i, 0, 0, i]);
            assert_eq!(&buf[..len], &payload[..]);

            let len = consumer.get_next_packet(&mut header, &mut buf).unwrap();
            assert_eq!(header, [i, 1, 1, i]);
            assert_eq!(&buf[..len], &payload[..1]);
        });

        assert_eq!(consumer.get_buffer_fill_payload(), 0);
    }

    #[test]
    fn packet_buffer_short_header() {
        let (mut producer, mut consumer) = PacketBuffer::new(4, 2, 4).unwrap();
        let mut header = [0xff; 4];
        let mut buf = [0; 4];

        // Leave stale bytes in both slots.
        (0..2).for_each(|_| {
            producer.add_packet(&[1, 2, 3, 4], &[5]).unwrap();
            consumer.get_next_packet(&mut header, &mut buf).unwrap();
        });

        producer.add_packet(&[9], &[6, 7]).unwrap();
        producer.add_packet(&[], &[]).unwrap();

        let len = consumer.get_next_packet(&mut header, &mut buf).unwrap();
        assert_eq!(header, [9, 0, 0, 0]);
        assert_eq!(&buf[..len], &[6, 7]);

        let len = consumer.get_next_packet(&mut header, &mut buf).unwrap();
        assert_eq!(header, [0, 0, 0, 0]);
        assert_eq!(len, 0);

        assert_eq!(producer.add_packet(&[0; 5], &[]), Err(IsochStreamError::TooLarge));
    }

    #[test]
    fn packet_buffer_overflow_and_underflow() {
        let (mut producer, mut consumer) = PacketBuffer::new(0, 2, 4).unwrap();
        let mut buf = [0; 4];

        assert_eq!(
            consumer.get_next_packet(&mut [], &mut buf),
            Err(IsochStreamError::Underflow)
        );
        assert_eq!(consumer.skip_packet(), Err(IsochStreamError::Underflow));

        producer.add_packet(&[], &[1]).unwrap();
        producer.add_packet(&[], &[2, 2]).unwrap();
        assert_eq!(
            producer.add_packet(&[], &[3, 3, 3]),
            Err(IsochStreamError::Overflow)
        );
        assert_eq!(
            producer.add_packet(&[], &[0; 5]),
            Err(IsochStreamError::TooLarge)
        );
        assert_eq!(producer.get_buffer_fill_packets(), 2);
        assert_eq!(producer.get_buffer_fill_payload(), 3);

        // The destination too small leaves the packet.
        let mut small = [0; 1];
        assert_eq!(consumer.skip_packet(), Ok(1));
        assert_eq!(
            consumer.get_next_packet(&mut [], &mut small),
            Err(IsochStreamError::TooLarge)
        );
        assert_eq!(consumer.get_next_packet(&mut [], &mut buf), Ok(2));
        assert_eq!(&buf[..2], &[2, 2]);
        assert_eq!(consumer.get_buffer_fill_packets(), 0);
    }

    #[test]
    fn packet_buffer_between_threads() {
        const COUNT: u32 = 20000;

        let (mut producer, mut consumer) = PacketBuffer::new(4, 8, 12).unwrap();

        let th = thread::spawn(move || {
            let mut seq = 0u32;
            while seq < COUNT {
                let payload = [seq.to_be_bytes(), (!seq).to_be_bytes(), seq.to_le_bytes()];
                let len = (seq % 3 + 1) as usize * 4;
                match producer.add_packet(&seq.to_le_bytes(), &payload.concat()[..len]) {
                    Ok(_) => seq += 1,
                    Err(IsochStreamError::Overflow) => thread::yield_now(),
                    Err(e) => panic!("{}", e),
                }
            }
        });

        let mut expected = 0u32;
        let mut header = [0; 4];
        let mut buf = [0; 12];
        while expected < COUNT {
            match consumer.get_next_packet(&mut header, &mut buf) {
                Ok(len) => {
                    assert_eq!(u32::from_le_bytes(header), expected);
                    assert_eq!(len, (expected % 3 + 1) as usize * 4);
                    assert_eq!(&buf[..4], &expected.to_be_bytes());
                    expected += 1;
                }
                Err(IsochStreamError::Underflow) => thread::yield_now(),
                Err(e) => panic!("{}", e),
            }
        }

        th.join().unwrap();
        assert!(consumer.is_abandoned());
        assert_eq!(consumer.get_buffer_fill_packets(), 0);
    }
}

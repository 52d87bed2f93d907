mod ringbuffer;

pub use self::ringbuffer::RingBuffer;

use std::time::Duration;

use bytepipe::{BytePipe, Error, Packet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// xorshift64; deterministic randomness for the interleaving tests.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[tokio::test]
async fn primitive_round_trip() {
    let pipe = BytePipe::new(true);
    pipe.write_u32(0x01020304).await.unwrap();
    pipe.write_u64(0x1122334455667788).await.unwrap();
    pipe.write_f32(1.5).await.unwrap();

    assert_eq!(pipe.read_u32().await.unwrap(), 0x01020304);
    assert_eq!(pipe.read_u64().await.unwrap(), 0x1122334455667788);
    assert_eq!(pipe.read_f32().await.unwrap(), 1.5);
    assert_eq!(pipe.total_bytes_read(), 16);
    assert_eq!(pipe.total_bytes_written(), 16);
}

#[tokio::test]
async fn float_bit_patterns_survive() {
    let pipe = BytePipe::new(true);
    for v in [0.0f64, -0.0, f64::INFINITY, f64::MIN_POSITIVE, 1.0e-300] {
        pipe.write_f64(v).await.unwrap();
        let got = pipe.read_f64().await.unwrap();
        assert_eq!(got.to_bits(), v.to_bits());
    }
    let nan = f64::from_bits(0x7FF8_0000_0000_1234);
    pipe.write_f64(nan).await.unwrap();
    assert_eq!(pipe.read_f64().await.unwrap().to_bits(), nan.to_bits());
}

// A primitive written across the wrap boundary reads back intact.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrap_at_boundary() {
    let pipe = BytePipe::new(true);
    let writer = pipe.clone();
    let producer = tokio::spawn(async move {
        writer.write_fully(&vec![0u8; 4085]).await.unwrap();
        writer.write_u32(0xAABBCCDD).await.unwrap();
    });

    assert_eq!(pipe.discard(4085).await.unwrap(), 4085);
    assert_eq!(pipe.read_u32().await.unwrap(), 0xAABBCCDD);
    producer.await.unwrap();
}

// Primitives written at many distinct positions around the wrap.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrap_at_many_offsets() {
    let pipe = bytepipe::pipe().auto_flush(true).capacity(64).build();
    let writer = pipe.clone();
    let producer = tokio::spawn(async move {
        for offset in 0..64u64 {
            writer.write_fully(&vec![0xEE; 60]).await.unwrap();
            writer.write_u64(offset.wrapping_mul(0x0101010101010101)).await.unwrap();
        }
    });

    for offset in 0..64u64 {
        assert_eq!(pipe.discard(60).await.unwrap(), 60);
        assert_eq!(pipe.read_u64().await.unwrap(), offset.wrapping_mul(0x0101010101010101));
    }
    producer.await.unwrap();
}

#[tokio::test]
async fn close_mid_stream() {
    let pipe = BytePipe::new(true);
    pipe.write_fully(&[1, 2, 3, 4, 5]).await.unwrap();
    pipe.close();

    let mut dst = [0u8; 10];
    assert_eq!(pipe.read_available(&mut dst).await.unwrap(), 5);
    assert_eq!(&dst[..5], &[1, 2, 3, 4, 5]);
    assert_eq!(pipe.read_available(&mut dst).await.unwrap(), 0);
    assert!(pipe.is_closed_for_read());
    assert!(matches!(pipe.write_u8(1).await, Err(Error::Closed)));
}

#[tokio::test]
async fn read_fully_past_close_is_unexpected_eof() {
    let pipe = BytePipe::new(true);
    pipe.write_fully(&[1, 2, 3]).await.unwrap();
    pipe.close();

    let mut dst = [0u8; 8];
    assert!(matches!(pipe.read_fully(&mut dst).await, Err(Error::UnexpectedEof)));
    assert_eq!(pipe.total_bytes_read(), 3);
}

// An abortive close resumes the parked writer and fails the reader with the
// same cause.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abortive_close_resumes_both_sides() {
    let pipe = BytePipe::new(true);
    let writer = pipe.clone();
    let producer = tokio::spawn(async move {
        // More than the ring holds, so the writer parks.
        let err = writer.write_fully(&vec![7u8; 10_000]).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pipe.fail(std::io::Error::other("boom")));
    producer.await.unwrap();

    let err = pipe.read_u8().await.unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert!(pipe.is_closed_for_read());
}

#[tokio::test]
async fn cancel_uses_the_cancelled_cause() {
    let pipe = BytePipe::new(true);
    assert!(pipe.cancel());
    assert!(!pipe.close());
    assert!(matches!(pipe.closed_cause(), Some(Error::Cancelled)));
    assert!(matches!(pipe.read_u8().await, Err(Error::Cancelled)));
    assert!(matches!(pipe.write_u8(0).await, Err(Error::Cancelled)));
}

// 10000 bytes through a 4088-byte ring arrive complete and in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backpressure_delivers_in_order() {
    const N: usize = 10_000;
    let pipe = BytePipe::new(false);
    let writer = pipe.clone();
    let producer = tokio::spawn(async move {
        let data: Vec<u8> = (0..N).map(|i| (i % 251) as u8).collect();
        writer.write_fully(&data).await.unwrap();
        writer.flush();
        writer.close();
    });

    let mut received = Vec::with_capacity(N);
    let mut buf = [0u8; 1024];
    loop {
        let n = pipe.read_available(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received.len(), N);
    assert!(received.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    assert_eq!(pipe.total_bytes_read(), N as u64);
    producer.await.unwrap();
}

// Without auto-flush, bytes stay invisible until the producer flushes.
#[tokio::test]
async fn explicit_flush_gates_visibility() {
    let pipe = BytePipe::new(false);
    pipe.write_u32(42).await.unwrap();
    assert_eq!(pipe.available_for_read(), 0);

    let mut buf = [0u8; 4];
    assert!(
        timeout(Duration::from_millis(50), pipe.read_available(&mut buf))
            .await
            .is_err()
    );

    pipe.flush();
    assert_eq!(pipe.available_for_read(), 4);
    assert_eq!(pipe.read_u32().await.unwrap(), 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_splices_and_propagates_close() {
    const N: u32 = 2000;
    let a = BytePipe::new(true);
    let b = BytePipe::new(true);

    let writer = a.clone();
    let producer = tokio::spawn(async move {
        for i in 0..N {
            writer.write_u32(i).await.unwrap();
        }
        writer.close();
    });

    let joiner = {
        let a = a.clone();
        let b = b.clone();
        tokio::spawn(async move { b.join_from(&a, true).await.unwrap() })
    };

    for i in 0..N {
        assert_eq!(b.read_u32().await.unwrap(), i);
    }
    assert_eq!(b.read_available(&mut [0u8; 8]).await.unwrap(), 0);
    assert!(b.is_closed_for_read());
    producer.await.unwrap();
    joiner.await.unwrap();
}

// Once the empty source terminates into the join, writes re-route directly.
#[tokio::test]
async fn joined_writes_reroute() {
    let a = BytePipe::new(true);
    let b = BytePipe::new(true);
    assert_eq!(b.join_from(&a, false).await.unwrap(), 0);

    a.write_u32(7).await.unwrap();
    assert_eq!(b.read_u32().await.unwrap(), 7);
    assert_eq!(b.total_bytes_written(), 4);

    // Close of the source does not propagate without delegate_close.
    a.close();
    assert!(!b.is_closed_for_write());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_chain_resolves_to_the_tail() {
    let a = BytePipe::new(true);
    let b = BytePipe::new(true);
    let c = BytePipe::new(true);

    b.join_from(&a, true).await.unwrap();
    c.join_from(&b, true).await.unwrap();

    a.write_fully(b"chained").await.unwrap();
    let mut buf = [0u8; 7];
    c.read_fully(&mut buf).await.unwrap();
    assert_eq!(&buf, b"chained");

    a.close();
    assert_eq!(c.read_available(&mut [0u8; 1]).await.unwrap(), 0);
}

#[tokio::test]
async fn copy_from_respects_the_limit() {
    let src = BytePipe::new(true);
    let dst = BytePipe::new(true);
    src.write_fully(b"0123456789").await.unwrap();
    src.close();

    assert_eq!(dst.copy_from(&src, 4).await.unwrap(), 4);
    let mut buf = [0u8; 4];
    dst.read_fully(&mut buf).await.unwrap();
    assert_eq!(&buf, b"0123");

    // The rest stays readable on the source.
    let mut rest = [0u8; 6];
    src.read_fully(&mut rest).await.unwrap();
    assert_eq!(&rest, b"456789");
}

// Visitors consuming random prefixes: the unconsumed reservation is always
// refunded and no byte is lost or duplicated.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn visitor_refund_fuzz() {
    const TOTAL: usize = 100_000;
    let pipe = bytepipe::pipe().auto_flush(true).capacity(256).build();
    let writer = pipe.clone();
    let producer = tokio::spawn(async move {
        let data: Vec<u8> = (0..TOTAL).map(|i| (i % 256) as u8).collect();
        writer.write_fully(&data).await.unwrap();
        writer.close();
    });

    let mut rng = Rng(0x2545F4914F6CDD1D);
    let mut received = Vec::with_capacity(TOTAL);
    loop {
        let r = rng.next() as usize;
        let result = pipe
            .read_with(1, |view| {
                let take = r % (view.len() + 1);
                received.extend_from_slice(&view[..take]);
                take
            })
            .await;
        match result {
            Ok(_) => {}
            Err(Error::UnexpectedEof) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(received.len(), TOTAL);
    assert!(received.iter().enumerate().all(|(i, &b)| b == (i % 256) as u8));
    producer.await.unwrap();
}

// Randomly interleaved writer and reader operations preserve FIFO order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_operations_preserve_fifo() {
    for seed in [1u64, 42, 0xBEEF, 987_654_321] {
        run_interleaving(seed).await;
    }
}

async fn run_interleaving(seed: u64) {
    const TOTAL: usize = 20_000;
    let pipe = bytepipe::pipe().capacity(512).build();
    let writer = pipe.clone();

    let producer = tokio::spawn(async move {
        let mut rng = Rng(seed | 1);
        let mut sent = 0usize;
        while sent < TOTAL {
            let n = ((rng.next() as usize) % 300 + 1).min(TOTAL - sent);
            let chunk: Vec<u8> = (sent..sent + n).map(|i| (i % 253) as u8).collect();
            if rng.next() % 2 == 0 {
                writer.write_fully(&chunk).await.unwrap();
            } else {
                let mut off = 0;
                while off < n {
                    off += writer.write_available(&chunk[off..]).await.unwrap();
                }
            }
            if rng.next() % 3 == 0 {
                writer.flush();
            }
            sent += n;
        }
        writer.flush();
        writer.close();
    });

    let mut rng = Rng(seed ^ 0x9E3779B97F4A7C15);
    let mut received = Vec::with_capacity(TOTAL);
    'outer: loop {
        if rng.next() % 2 == 0 {
            let mut buf = [0u8; 257];
            let n = pipe.read_available(&mut buf).await.unwrap();
            if n == 0 {
                break 'outer;
            }
            received.extend_from_slice(&buf[..n]);
        } else {
            let r = rng.next() as usize;
            let result = pipe
                .read_with(1, |view| {
                    let take = r % (view.len() + 1);
                    received.extend_from_slice(&view[..take]);
                    take
                })
                .await;
            match result {
                Ok(_) => {}
                Err(Error::UnexpectedEof) => break 'outer,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }
    assert_eq!(received.len(), TOTAL, "seed {seed}");
    assert!(
        received.iter().enumerate().all(|(i, &b)| b == (i % 253) as u8),
        "seed {seed}"
    );
    producer.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_concurrent_reader_is_rejected() {
    let pipe = BytePipe::new(true);
    let reader = pipe.clone();
    let parked = tokio::spawn(async move { reader.read_u32().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(pipe.read_u32().await, Err(Error::Busy)));

    pipe.write_u32(5).await.unwrap();
    assert_eq!(parked.await.unwrap().unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attached_token_cancels_the_pipe() {
    let pipe = BytePipe::new(true);
    let token = CancellationToken::new();
    pipe.attach_token(token.clone());

    token.cancel();
    timeout(Duration::from_secs(1), async {
        while !pipe.is_closed_for_write() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(pipe.closed_cause(), Some(Error::Cancelled)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abortive_close_cancels_the_attached_token() {
    let pipe = BytePipe::new(true);
    let token = CancellationToken::new();
    pipe.attach_token(token.clone());

    pipe.fail(std::io::Error::other("down"));
    assert!(token.is_cancelled());

    // A clean close must not cancel the token.
    let pipe = BytePipe::new(true);
    let token = CancellationToken::new();
    pipe.attach_token(token.clone());
    pipe.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn utf8_lines() {
    let pipe = BytePipe::from_slice(b"alpha\nbeta\r\n\ngamma");
    assert_eq!(pipe.read_utf8_line(100).await.unwrap().as_deref(), Some("alpha"));
    assert_eq!(pipe.read_utf8_line(100).await.unwrap().as_deref(), Some("beta"));
    assert_eq!(pipe.read_utf8_line(100).await.unwrap().as_deref(), Some(""));
    assert_eq!(pipe.read_utf8_line(100).await.unwrap().as_deref(), Some("gamma"));
    assert_eq!(pipe.read_utf8_line(100).await.unwrap(), None);
}

#[tokio::test]
async fn line_limit_and_encoding_errors() {
    let pipe = BytePipe::from_slice(b"way too long\n");
    assert!(matches!(pipe.read_utf8_line(4).await, Err(Error::TooLongLine(4))));

    let pipe = BytePipe::from_slice(&[0xFF, 0xFE, b'\n']);
    assert!(matches!(pipe.read_utf8_line(100).await, Err(Error::MalformedInput)));
}

#[tokio::test]
async fn multibyte_utf8_across_chunks() {
    let pipe = bytepipe::pipe().auto_flush(true).capacity(64).build();
    let text = "héllo wörld — ☃\n";
    pipe.write_fully(text.as_bytes()).await.unwrap();
    pipe.close();
    assert_eq!(
        pipe.read_utf8_line(100).await.unwrap().as_deref(),
        Some(text.trim_end_matches('\n'))
    );
}

#[tokio::test]
async fn packets_round_trip() {
    let pipe = BytePipe::new(true);
    let mut p = Packet::new();
    p.write_u16(3);
    p.write_fully(b"abc");
    pipe.write_packet(p).await.unwrap();
    pipe.close();

    let mut got = pipe.read_packet(5).await.unwrap();
    assert_eq!(got.read_u16().unwrap(), 3);
    let mut name = [0u8; 3];
    got.read_fully(&mut name).unwrap();
    assert_eq!(&name, b"abc");

    assert!(matches!(pipe.read_packet(1).await, Err(Error::UnexpectedEof)));
}

#[tokio::test]
async fn read_remaining_stops_at_limit_or_eof() {
    let pipe = BytePipe::new(true);
    pipe.write_fully(b"0123456789").await.unwrap();
    pipe.close();

    let head = pipe.read_remaining(4).await.unwrap();
    assert_eq!(head.as_slice(), b"0123");
    let rest = pipe.read_remaining(u64::MAX).await.unwrap();
    assert_eq!(rest.as_slice(), b"456789");
}

#[tokio::test]
async fn peek_does_not_consume() {
    let pipe = BytePipe::new(true);
    pipe.write_fully(b"0123456789").await.unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(pipe.peek_to(&mut buf, 2, 1).await.unwrap(), 4);
    assert_eq!(&buf, b"2345");
    assert_eq!(pipe.available_for_read(), 10);

    let mut out = [0u8; 10];
    pipe.read_fully(&mut out).await.unwrap();
    assert_eq!(&out, b"0123456789");
}

#[tokio::test]
async fn await_helpers() {
    let pipe = BytePipe::new(true);
    pipe.write_fully(&[1, 2, 3]).await.unwrap();
    assert!(pipe.await_at_least(3).await.unwrap());
    pipe.close();
    assert!(!pipe.await_at_least(4).await.unwrap());
    pipe.await_content().await.unwrap();
}

#[tokio::test]
async fn write_session_commits_and_refunds() {
    let pipe = BytePipe::new(false);
    let mut session = pipe.write_session();
    session.await_free_space(16).await.unwrap();

    let view = session.request(16).unwrap().unwrap();
    assert!(view.len() >= 16);
    view[..4].copy_from_slice(b"ping");
    session.written(4);
    session.flush();
    drop(session);

    assert_eq!(pipe.available_for_read(), 4);
    let mut buf = [0u8; 4];
    pipe.read_fully(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // The refunded reservation left the full remainder writable.
    assert_eq!(pipe.available_for_write(), bytepipe::DEFAULT_CAPACITY);
}

#[tokio::test]
async fn write_while_fills_in_steps() {
    let pipe = BytePipe::new(true);
    let mut chunks = vec![b"aa".to_vec(), b"bbb".to_vec(), b"c".to_vec()];
    chunks.reverse();
    let total = pipe
        .write_while(|view| match chunks.pop() {
            Some(chunk) => {
                view[..chunk.len()].copy_from_slice(&chunk);
                (chunk.len(), !chunks.is_empty())
            }
            None => (0, false),
        })
        .await
        .unwrap();
    assert_eq!(total, 6);

    let mut buf = [0u8; 6];
    pipe.read_fully(&mut buf).await.unwrap();
    assert_eq!(&buf, b"aabbbc");
}

#[tokio::test]
async fn zero_copy_write_visitor() {
    let pipe = BytePipe::new(true);
    let n = pipe
        .write_with(8, |view| {
            view[..8].copy_from_slice(b"visitors");
            8
        })
        .await
        .unwrap();
    assert_eq!(n, 8);

    let consumed = pipe
        .read_with(8, |view| {
            assert_eq!(&view[..8], b"visitors");
            8
        })
        .await
        .unwrap();
    assert_eq!(consumed, 8);
}

#[tokio::test]
async fn try_variants_do_not_suspend() {
    let pipe = BytePipe::new(true);
    assert_eq!(pipe.try_read_with(1, |_| 0).unwrap(), Some(0));

    pipe.write_u8(9).await.unwrap();
    assert_eq!(pipe.try_read_with(1, |view| view.len()).unwrap(), Some(1));

    pipe.close();
    assert_eq!(pipe.try_read_with(1, |_| 0).unwrap(), None);
    assert!(pipe.try_write_with(1, |_| 0).is_err());
}

#[tokio::test]
async fn preloaded_pipe_reads_out_its_content() {
    let pipe = BytePipe::from_slice(b"preloaded");
    assert_eq!(pipe.available_for_read(), 9);
    let mut buf = [0u8; 9];
    pipe.read_fully(&mut buf).await.unwrap();
    assert_eq!(&buf, b"preloaded");
    assert!(pipe.is_closed_for_read());
}

// The sum of reads always equals the sum of writes plus what is buffered.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn totals_balance() {
    let pipe = bytepipe::pipe().auto_flush(true).capacity(128).build();
    let writer = pipe.clone();
    let producer = tokio::spawn(async move {
        writer.write_fully(&vec![5u8; 1000]).await.unwrap();
        writer.close();
    });

    let mut buf = [0u8; 64];
    while pipe.read_available(&mut buf).await.unwrap() > 0 {}
    producer.await.unwrap();

    assert_eq!(pipe.total_bytes_written(), 1000);
    assert_eq!(pipe.total_bytes_read(), 1000);
}

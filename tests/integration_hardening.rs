//! Error paths, accounting and control-plane edge cases

use pktdma_core::{EngineConfig, Error, FrameKind, MemoryError, NetifConfig, Origin};
use pktdma_engine::{
    BufferMode, ReceiveBufferPool, RedirectError, RedirectTarget, RxDescriptor, SteerDest,
    SteerRule, XdpAction, XdpFrame,
};
use pktdma_integration_tests::{Harness, Scripted, config, ethernet, zc_pool};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn receive(h: &Harness, pool: &mut ReceiveBufferPool, desc: &mut RxDescriptor, frame: &[u8]) -> Result<(), Error> {
    h.iommu.device_write(pool.dma_address(desc), frame).unwrap();
    pool.get(desc, frame.len())
}

// ============================================================================
// In-flight accounting
// ============================================================================

#[test]
fn test_delivered_packet_keeps_netif_busy_until_released() {
    let h = Harness::new(config(true));
    let prog = Scripted::new(XdpAction::Pass);
    h.device.attach(1, prog.clone()).unwrap();
    let mut pool = h.device.rx_pool(0).unwrap();
    let mut desc = RxDescriptor::new();
    pool.alloc(&mut desc).unwrap();

    receive(&h, &mut pool, &mut desc, &ethernet(64)).unwrap();
    let skb = desc.take_packet().unwrap();
    assert_eq!(skb.in_flight_netif(), Some(1));
    assert_eq!(h.device.in_flight(1), 1);
    assert!(!h.device.wait_idle(1, Duration::from_millis(10)));

    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        drop(skb);
    });
    assert!(h.device.wait_idle(1, Duration::from_secs(5)));
    release.join().unwrap();
    assert_eq!(prog.runs(), 1);
    pool.free(&mut desc);
}

#[test]
fn test_dropped_packet_reposts_same_half() {
    let h = Harness::new(config(true));
    h.device.attach(1, Scripted::new(XdpAction::Drop)).unwrap();
    let mut pool = h.device.rx_pool(0).unwrap();
    let mut desc = RxDescriptor::new();
    pool.alloc(&mut desc).unwrap();
    let before = desc.page();

    assert!(matches!(
        receive(&h, &mut pool, &mut desc, &ethernet(64)),
        Err(Error::Unavailable)
    ));
    assert!(pool.avail(&mut desc));
    assert_eq!(desc.page(), before);
    assert_eq!(h.device.in_flight(1), 0);
    pool.free(&mut desc);
}

#[test]
fn test_aborted_program_drops() {
    let h = Harness::new(config(true));
    h.device.attach(1, Scripted::new(XdpAction::Aborted)).unwrap();
    let mut pool = h.device.rx_pool(0).unwrap();
    let mut desc = RxDescriptor::new();
    pool.alloc(&mut desc).unwrap();

    let err = receive(&h, &mut pool, &mut desc, &ethernet(64)).unwrap_err();
    assert!(err.is_outcome());
    assert!(!err.is_retryable());
    assert!(desc.take_packet().is_none());
    pool.free(&mut desc);
}

// ============================================================================
// Filter transmit and steering
// ============================================================================

#[test]
fn test_transmit_verdict_sends_action_frame() {
    let h = Harness::new(config(true));
    h.device.attach(1, Scripted::new(XdpAction::Tx)).unwrap();
    let mut pool = h.device.rx_pool(0).unwrap();
    let mut desc = RxDescriptor::new();
    pool.alloc(&mut desc).unwrap();

    assert!(matches!(
        receive(&h, &mut pool, &mut desc, &ethernet(80)),
        Err(Error::Unavailable)
    ));
    assert!(pool.avail(&mut desc));
    assert_eq!(h.txq.sent(), 1);
    h.txq.with_sent(|sent| {
        assert_eq!(sent[0].1.origin(), Origin::FilterRedirectFrame(FrameKind::Action));
        assert_eq!(sent[0].1.len(), 80);
    });

    h.txq.complete_all(h.device.resolver());
    pool.free(&mut desc);
    assert_eq!(h.device.live_pages(), 0);
    assert_eq!(h.iommu.live_mappings(), 0);
}

#[test]
fn test_steering_rules_pick_destination() {
    let mut cfg = config(true);
    cfg.netifs.push(NetifConfig::new(2));
    let h = Harness::new(cfg);
    let prog = Scripted::new(XdpAction::Pass);
    h.device.attach(2, prog.clone()).unwrap();

    let ipv4 = SteerRule::new(SteerDest::Netif(2))
        .match_frame(12, &[0x08, 0x00], &[0xff, 0xff])
        .on_chan(1);
    let id = h.device.create_steer_rule(ipv4).unwrap();
    assert_eq!(h.device.steer_rules().len(), 1);

    let mut pool = h.device.rx_pool(1).unwrap();
    let mut desc = RxDescriptor::new();
    pool.alloc(&mut desc).unwrap();

    receive(&h, &mut pool, &mut desc, &ethernet(64)).unwrap();
    let skb = desc.take_packet().unwrap();
    assert_eq!(skb.in_flight_netif(), Some(2));
    drop(skb);
    assert_eq!(prog.runs(), 1);

    // no rule matches IPv6 on a non-empty table
    let mut v6 = ethernet(64);
    v6[12] = 0x86;
    v6[13] = 0xdd;
    assert!(pool.avail(&mut desc));
    assert!(matches!(receive(&h, &mut pool, &mut desc, &v6), Err(Error::Unavailable)));
    assert_eq!(prog.runs(), 1);

    // an empty table delivers without running a program
    h.device.destroy_steer_rule(id).unwrap();
    assert!(pool.avail(&mut desc));
    receive(&h, &mut pool, &mut desc, &v6).unwrap();
    assert_eq!(desc.take_packet().unwrap().in_flight_netif(), None);
    assert_eq!(prog.runs(), 1);

    assert!(matches!(h.device.destroy_steer_rule(id), Err(Error::NotFound(_))));
    pool.free(&mut desc);
}

#[test]
fn test_xdp_xmit_needs_known_netif() {
    let h = Harness::new(config(false));
    let frames = vec![XdpFrame::from_bytes(&ethernet(64)).unwrap()];
    assert!(matches!(h.device.xdp_xmit(7, frames), Err(Error::NotFound(_))));
}

#[test]
fn test_xdp_xmit_stops_at_busy_rings() {
    let h = Harness::new(config(false));
    h.txq.set_room(2);
    let frames = (0..4)
        .map(|_| XdpFrame::from_bytes(&ethernet(64)).unwrap())
        .collect();
    assert_eq!(h.device.xdp_xmit(1, frames).unwrap(), 2);
    h.txq.complete_all(h.device.resolver());
    assert_eq!(h.iommu.live_mappings(), 0);
}

// ============================================================================
// Zero-copy pool exhaustion
// ============================================================================

#[test]
fn test_empty_pool_requests_wakeup() {
    let h = Harness::new(config(false));
    let zc = zc_pool(2, 2);
    h.device.bind(1, 0, Arc::clone(&zc)).unwrap();
    let mut pool = h.device.rx_pool(0).unwrap();

    let mut descs: Vec<RxDescriptor> = (0..3).map(|_| RxDescriptor::new()).collect();
    pool.alloc(&mut descs[0]).unwrap();
    pool.alloc(&mut descs[1]).unwrap();
    let err = pool.alloc(&mut descs[2]).unwrap_err();
    assert_eq!(err, MemoryError::PoolEmpty);
    assert!(descs[2].is_empty());
    assert!(zc.rx_needs_wakeup());

    h.device.wakeup(0).unwrap();
    assert!(!zc.rx_needs_wakeup());

    pool.free(&mut descs[0]);
    pool.alloc(&mut descs[2]).unwrap();
    for desc in &mut descs {
        pool.free(desc);
    }
}

#[test]
fn test_full_redirect_target_holds_frame_for_retry() {
    let h = Harness::new(config(false));
    let zc = zc_pool(4, 4);
    h.device.bind(1, 0, Arc::clone(&zc)).unwrap();
    h.device
        .attach(1, Scripted::new(XdpAction::Redirect(RedirectTarget::Netif(5))))
        .unwrap();
    let mut pool = h.device.rx_pool(0).unwrap();
    let mut desc = RxDescriptor::new();
    pool.alloc(&mut desc).unwrap();
    let frame = ethernet(64);

    h.redirector.refuse(Some(RedirectError::NoSpace));
    let err = receive(&h, &mut pool, &mut desc, &frame).unwrap_err();
    assert!(matches!(err, Error::Busy));
    assert!(err.is_retryable());
    assert!(!desc.is_empty());

    h.redirector.refuse(None);
    assert!(matches!(pool.get(&mut desc, frame.len()), Err(Error::Unavailable)));
    assert!(desc.is_empty());
    assert_eq!(h.redirector.targets(), vec![5]);
}

#[test]
fn test_unknown_redirect_target_drops_frame() {
    let h = Harness::new(config(false));
    let zc = zc_pool(4, 4);
    h.device.bind(1, 0, Arc::clone(&zc)).unwrap();
    h.device
        .attach(1, Scripted::new(XdpAction::Redirect(RedirectTarget::Netif(5))))
        .unwrap();
    h.redirector
        .refuse(Some(RedirectError::NoTarget(RedirectTarget::Netif(5))));

    let mut pool = h.device.rx_pool(0).unwrap();
    let mut desc = RxDescriptor::new();
    pool.alloc(&mut desc).unwrap();
    assert!(matches!(
        receive(&h, &mut pool, &mut desc, &ethernet(64)),
        Err(Error::Unavailable)
    ));
    assert!(desc.is_empty());
}

// ============================================================================
// Control plane
// ============================================================================

#[test]
fn test_attach_requires_paged_or_zero_copy() {
    let h = Harness::new(config(false));
    let err = h
        .device
        .attach(1, Scripted::new(XdpAction::Pass))
        .unwrap_err();
    assert!(matches!(err, Error::ModeNotEnabled(_)));
    assert!(!err.is_retryable());
    assert!(matches!(
        h.device.attach(4, Scripted::new(XdpAction::Pass)),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_queue_indices_are_checked() {
    let h = Harness::new(config(false));
    assert!(matches!(
        h.device.rx_pool(4),
        Err(Error::QueueOutOfRange { queue: 4, limit: 4 })
    ));
    assert!(matches!(
        h.device.bind(1, 9, zc_pool(2, 2)),
        Err(Error::QueueOutOfRange { .. })
    ));
    assert!(matches!(h.device.unbind(0), Err(Error::NotFound(_))));
    assert!(matches!(h.device.wakeup(0), Err(Error::NotFound(_))));
    assert!(matches!(h.device.xsk_napi_tx(0, 8), Err(Error::NotFound(_))));
    assert!(h.poll.events().is_empty());
}

#[test]
fn test_mapping_failure_leaves_descriptor_empty() {
    let h = Harness::new(config(true));
    let mut pool = h.device.rx_pool(0).unwrap();
    let mut desc = RxDescriptor::new();

    h.iommu.fail_next_maps(1);
    assert!(matches!(pool.alloc(&mut desc), Err(MemoryError::Mapping { .. })));
    assert!(desc.is_empty());
    assert_eq!(h.device.live_pages(), 0);

    pool.alloc(&mut desc).unwrap();
    pool.free(&mut desc);
}

#[test]
fn test_device_from_toml() {
    let config = EngineConfig::from_toml_str(
        r#"
        [device]
        rx_queues = 2
        tx_queues = 2
        page_buffer_mode = true
        rx_buf_size = 3000

        [[netifs]]
        id = 1
        bind_chan = 0
        "#,
    )
    .unwrap();
    let h = Harness::new(config);

    let sel = h.device.select_mode(0);
    assert_eq!(sel.mode, BufferMode::Paged);
    assert!(sel.page_size >= 2 * 3000);
    assert!(sel.page_size.is_power_of_two());
    assert_eq!(h.device.rx_pool(1).unwrap().mode(), BufferMode::Paged);
}

#[test]
fn test_netif_lifecycle() {
    let h = Harness::new(config(true));
    h.device.add_netif(NetifConfig::new(3)).unwrap();
    assert!(matches!(
        h.device.add_netif(NetifConfig::new(3)),
        Err(Error::Exists(_))
    ));
    h.device.attach(3, Scripted::new(XdpAction::Pass)).unwrap();
    assert_eq!(h.device.filter().programs_attached(), 1);
    h.device.remove_netif(3).unwrap();
    assert_eq!(h.device.filter().programs_attached(), 0);
    assert!(matches!(h.device.remove_netif(3), Err(Error::NotFound(_))));
}

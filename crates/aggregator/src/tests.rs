//! Integration tests for the aggregator pipeline.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use num_bigint::BigUint;
    use num_traits::Zero;
    use tokio::sync::broadcast;
    use wom_core::{
        codes, Address, ClaimReceipt, DeedAttributes, DeedCard, DocumentStore, HubReportData, HubReportStatus,
        HubReportVerifiableData, MemoryStore, UemRewardStatus, WomError,
    };
    use wom_crypto::{compute_merkle_root, sign_report, EthSigner};
    use wom_events::{topics, Event, EventBus};
    use wom_federation::{FederationConfig, FederationRegistry};
    use wom_settlement::{RewardConfig, TokenMover, DEFAULT_PERIOD_LENGTH_SECS, DEFAULT_START_REWARD_TIME};

    use crate::poster::DryRunSubmitter;
    use crate::service::{AggregatorConfig, AggregatorService};

    const START: u64 = DEFAULT_START_REWARD_TIME;
    const WEEK: u64 = DEFAULT_PERIOD_LENGTH_SECS;
    const DAY: u64 = 86_400;
    /// One hour into period 10.
    const NOW: u64 = START + 10 * WEEK + 3_600;
    const PERIOD_END: u64 = START + 11 * WEEK;

    fn addr(n: u8) -> Address {
        Address::from_bytes([n; 20])
    }

    fn token() -> Address {
        addr(0xcc)
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: Arc<EventBus>,
        events: broadcast::Receiver<Event>,
        registry: FederationRegistry,
        service: AggregatorService,
        hub1: EthSigner,
        hub2: EthSigner,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let bus = Arc::new(EventBus::new());
            bus.init().unwrap();
            let events = bus.subscribe();
            let updater = addr(0xee);
            let registry = FederationRegistry::new(
                FederationConfig {
                    deed_updater: updater.clone(),
                },
                store.clone(),
                bus.clone(),
            );
            registry
                .update_deed(
                    &updater,
                    &DeedAttributes::new(1, DeedCard::Common, addr(0x01), addr(0x11)).owner_percentage(20),
                    None,
                    NOW - 3 * DAY,
                )
                .unwrap();
            registry
                .update_deed(
                    &updater,
                    &DeedAttributes::new(2, DeedCard::Uncommon, addr(0x02), addr(0x12)).owner_percentage(30),
                    None,
                    NOW - 3 * DAY,
                )
                .unwrap();

            let hub1 = EthSigner::random();
            let hub2 = EthSigner::random();
            registry.connect(&addr(0x11), &hub1.address(), 1, NOW - 2 * DAY).unwrap();
            registry.connect(&addr(0x12), &hub2.address(), 2, NOW - 2 * DAY).unwrap();

            let config = AggregatorConfig {
                reward_token_address: token(),
                ..Default::default()
            };
            let service = AggregatorService::new(config, RewardConfig::default(), store.clone(), bus.clone());
            Self {
                store,
                bus,
                events,
                registry,
                service,
                hub1,
                hub2,
            }
        }

        fn events_named(&mut self, name: &str) -> Vec<Event> {
            let mut found = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if event.name == name {
                    found.push(event);
                }
            }
            found
        }
    }

    fn payload(hub: &EthSigner, deed_id: u64, from_date: u64, to_date: u64) -> HubReportData {
        HubReportData {
            hub_address: hub.address(),
            deed_id,
            from_date,
            to_date,
            period_type: "WEEK".into(),
            users_count: 550,
            participants_count: 452,
            recipients_count: 322,
            achievements_count: 540_978,
            reward_token_address: token(),
            reward_token_network_id: 137,
            hub_reward_amount: 2440.0,
            transactions: Default::default(),
        }
    }

    fn signed(hub: &EthSigner, deed_id: u64) -> HubReportVerifiableData {
        sign_report(hub, payload(hub, deed_id, NOW - 7 * DAY, NOW - 100)).unwrap()
    }

    static TRANSFERS: AtomicU64 = AtomicU64::new(1);

    #[derive(Default)]
    struct RecordingMover {
        transfers: Mutex<Vec<(Address, BigUint)>>,
    }

    impl TokenMover for RecordingMover {
        fn transfer(&self, receiver: &Address, amount: &BigUint) -> Result<String, WomError> {
            self.transfers.lock().unwrap().push((receiver.clone(), amount.clone()));
            Ok(format!("0x{:064x}", TRANSFERS.fetch_add(1, Ordering::SeqCst)))
        }
    }

    fn restore(f: &Fixture) -> AggregatorService {
        AggregatorService::restore(
            f.service.config().clone(),
            RewardConfig::default(),
            f.store.clone(),
            f.bus.clone(),
        )
        .unwrap()
    }

    // =========================================================================
    // Report submission
    // =========================================================================

    #[tokio::test]
    async fn test_submit_valid_report() {
        let mut f = Fixture::new();
        let report = f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();

        assert_eq!(report.status, HubReportStatus::Sent);
        assert_eq!(report.report_id, 1);
        assert_eq!(report.reward_period_id, 10);
        assert_eq!(report.fixed_reward_index.to_string(), "217609814963797264682");
        assert_eq!(report.owner, addr(0x01));
        assert_eq!(report.tenant, addr(0x11));
        assert_eq!(f.store.report(&report.hash).unwrap(), Some(report.clone()));

        let saved = f.events_named(topics::HUB_REPORT_SAVED);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].payload_as::<String>().unwrap(), report.hash);
    }

    #[tokio::test]
    async fn test_submit_json_body() {
        let f = Fixture::new();
        let body = serde_json::to_string(&signed(&f.hub1, 1)).unwrap();
        let report = f.service.submit_report_json(&body, NOW).await.unwrap();
        assert_eq!(report.report_id, 1);

        let err = f.service.submit_report_json("{\"hubAddress\": 3}", NOW).await.unwrap_err();
        assert_eq!(err.code(), codes::MALFORMED_PAYLOAD);
    }

    #[tokio::test]
    async fn test_resubmission_returns_stored_report() {
        let f = Fixture::new();
        let report = signed(&f.hub1, 1);
        let first = f.service.submit_report(report.clone(), NOW).await.unwrap();
        let second = f.service.submit_report(report, NOW + 60).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.store.reports_by_hub(&f.hub1.address()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_report_in_period_rejected() {
        let f = Fixture::new();
        f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();

        let again = sign_report(&f.hub1, payload(&f.hub1, 1, NOW - 3_600, NOW - 50)).unwrap();
        let err = f.service.submit_report(again, NOW + 60).await.unwrap_err();
        assert_eq!(err.code(), codes::HUB_ALREADY_REPORTED);
    }

    #[tokio::test]
    async fn test_signature_rejections() {
        let f = Fixture::new();

        let mut tampered = signed(&f.hub1, 1);
        tampered.data.users_count += 1;
        let err = f.service.submit_report(tampered, NOW).await.unwrap_err();
        assert_eq!(err.code(), codes::INVALID_SIGNED_MESSAGE);

        let mut wrong_hash = signed(&f.hub1, 1);
        wrong_hash.hash = format!("0x{}", "00".repeat(32));
        let err = f.service.submit_report(wrong_hash, NOW).await.unwrap_err();
        assert_eq!(err.code(), codes::WRONG_SIGNATURE_HASH);

        // Signed by hub2 on behalf of hub1.
        let forged = sign_report(&f.hub2, payload(&f.hub1, 1, NOW - 7 * DAY, NOW - 100)).unwrap();
        let err = f.service.submit_report(forged, NOW).await.unwrap_err();
        assert_eq!(err.code(), codes::INVALID_SIGNED_MESSAGE);
    }

    #[tokio::test]
    async fn test_hub_eligibility_rejections() {
        let f = Fixture::new();

        let stranger = EthSigner::random();
        let err = f.service.submit_report(signed(&stranger, 1), NOW).await.unwrap_err();
        assert_eq!(err.code(), codes::HUB_NOT_CONNECTED);

        let early = sign_report(&f.hub1, payload(&f.hub1, 1, NOW - 9 * DAY, NOW - 3 * DAY)).unwrap();
        let err = f.service.submit_report(early, NOW).await.unwrap_err();
        assert_eq!(err.code(), codes::REPORT_BEFORE_CONNECTION);

        let mut data = payload(&f.hub1, 1, NOW - 7 * DAY, NOW - 100);
        data.reward_token_address = addr(0xdd);
        let err = f.service.submit_report(sign_report(&f.hub1, data).unwrap(), NOW).await.unwrap_err();
        assert_eq!(err.code(), codes::UNSUPPORTED_REWARD_CONTRACT);
    }

    #[tokio::test]
    async fn test_report_before_uem_start() {
        let f = Fixture::new();
        let updater = addr(0xee);
        f.registry
            .update_deed(
                &updater,
                &DeedAttributes::new(3, DeedCard::Rare, addr(0x03), addr(0x13)),
                None,
                START - 10 * DAY,
            )
            .unwrap();
        let hub = EthSigner::random();
        f.registry.connect(&addr(0x13), &hub.address(), 3, START - 5 * DAY).unwrap();

        let report = sign_report(&hub, payload(&hub, 3, START - 4 * DAY, START - DAY)).unwrap();
        let err = f.service.submit_report(report, NOW).await.unwrap_err();
        assert_eq!(err.code(), codes::REPORT_BEFORE_UEM);
    }

    #[tokio::test]
    async fn test_manager_change_stops_reports() {
        let f = Fixture::new();
        f.registry
            .update_deed(
                &addr(0xee),
                &DeedAttributes::new(1, DeedCard::Common, addr(0x01), addr(0x19)).owner_percentage(20),
                None,
                NOW - DAY,
            )
            .unwrap();
        let err = f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap_err();
        assert_eq!(err.code(), codes::HUB_MANAGER_CHANGED);
    }

    #[tokio::test]
    async fn test_report_overlapping_last_report() {
        let f = Fixture::new();
        f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();

        let next = NOW + WEEK;
        let overlapping = sign_report(&f.hub1, payload(&f.hub1, 1, NOW - 2 * DAY, next - 100)).unwrap();
        let err = f.service.submit_report(overlapping, next).await.unwrap_err();
        assert_eq!(err.code(), codes::REPORT_BEFORE_LAST_REWARDED);

        let following = sign_report(&f.hub1, payload(&f.hub1, 1, NOW - 100, next - 100)).unwrap();
        let report = f.service.submit_report(following, next).await.unwrap();
        assert_eq!(report.reward_period_id, 11);
    }

    // =========================================================================
    // Reward computation and payout
    // =========================================================================

    #[tokio::test]
    async fn test_compute_reward_after_period_end() {
        let mut f = Fixture::new();
        let r1 = f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();
        let r2 = f.service.submit_report(signed(&f.hub2, 2), NOW).await.unwrap();

        assert!(f.service.compute_rewards(NOW + DAY).await.is_empty());

        let rewards = f.service.compute_rewards(PERIOD_END).await;
        assert_eq!(rewards.len(), 1);
        let reward = &rewards[0];
        assert_eq!(reward.id, "137-10");
        assert_eq!(reward.from_date, START + 10 * WEEK);
        assert_eq!(reward.to_date, PERIOD_END);
        assert_eq!(reward.status, UemRewardStatus::None);
        assert_eq!(reward.hub_addresses.len(), 2);
        assert_eq!(reward.hub_achievements_count, 2 * 540_978);
        assert_eq!(
            reward.merkle_root,
            compute_merkle_root(&[r1.hash.clone(), r2.hash.clone()]).unwrap()
        );

        let total: BigUint = reward.report_rewards.values().sum();
        assert!(total <= reward.amount);
        assert!(&reward.amount - &total < BigUint::from(2u32));

        let stored = f.store.report(&r1.hash).unwrap().unwrap();
        assert_eq!(stored.reward_id.as_deref(), Some("137-10"));
        assert_eq!(&stored.reward_amount, &reward.report_rewards[&r1.hash]);

        assert_eq!(f.events_named(topics::REWARD_COMPUTED).len(), 1);
        let mut computed = f.bus.subscribe();
        f.service.compute_reward(10, PERIOD_END + 1).await.unwrap();
        let names: Vec<String> = std::iter::from_fn(|| computed.try_recv().ok()).map(|e| e.name).collect();
        assert_eq!(
            names.iter().filter(|n| *n == topics::HUB_REPORT_REWARD_COMPUTED).count(),
            2
        );
        assert_eq!(names.iter().filter(|n| *n == topics::REWARD_COMPUTED).count(), 1);
    }

    #[tokio::test]
    async fn test_send_and_refresh_reward() {
        let f = Fixture::new();
        let r1 = f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();
        f.service.submit_report(signed(&f.hub2, 2), NOW).await.unwrap();
        f.service.compute_rewards(PERIOD_END).await;

        let submitter = DryRunSubmitter::new();
        assert_eq!(f.service.send_pending_rewards(&submitter).await.unwrap(), 1);
        assert_eq!(f.service.send_pending_rewards(&submitter).await.unwrap(), 0);
        assert_eq!(submitter.submission_count(), 1);

        let reward = f.store.reward("137-10").unwrap().unwrap();
        assert_eq!(reward.status, UemRewardStatus::PendingReward);
        let tx_hash = reward.transaction_hashes.iter().next().unwrap().clone();
        let report = f.store.report(&r1.hash).unwrap().unwrap();
        assert_eq!(report.status, HubReportStatus::PendingReward);
        assert_eq!(report.reward_transaction_hash.as_deref(), Some(tx_hash.as_str()));

        // A sent reward is never recomputed.
        let again = f.service.compute_reward(10, PERIOD_END + WEEK).await.unwrap().unwrap();
        assert_eq!(again, reward);

        // Not mined yet.
        let status = f.service.poster().refresh_reward_status("137-10", &HashMap::new()).unwrap();
        assert_eq!(status, Some(UemRewardStatus::PendingReward));

        let mined = HashMap::from([(tx_hash.clone(), true)]);
        let status = f.service.poster().refresh_reward_status("137-10", &mined).unwrap();
        assert_eq!(status, Some(UemRewardStatus::Rewarded));
        let report = f.store.report(&r1.hash).unwrap().unwrap();
        assert_eq!(report.status, HubReportStatus::Rewarded);
    }

    #[tokio::test]
    async fn test_failed_payout_transaction() {
        let f = Fixture::new();
        f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();
        f.service.compute_rewards(PERIOD_END).await;
        f.service.send_pending_rewards(&DryRunSubmitter::new()).await.unwrap();

        let reward = f.store.reward("137-10").unwrap().unwrap();
        let tx_hash = reward.transaction_hashes.iter().next().unwrap().clone();
        let mined = HashMap::from([(tx_hash, false)]);
        let status = f.service.poster().refresh_reward_status("137-10", &mined).unwrap();
        assert_eq!(status, Some(UemRewardStatus::RewardTransactionError));
        assert!(f.service.poster().refresh_reward_status("1-1", &mined).unwrap().is_none());
    }

    // =========================================================================
    // Claims
    // =========================================================================

    #[tokio::test]
    async fn test_claim_after_period_close() {
        let mut f = Fixture::new();
        f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();
        let owner = addr(0x01);
        let tenant = addr(0x11);
        assert!(f.service.pending_reward_balance_of(&owner).await.is_zero());

        f.service.compute_rewards(PERIOD_END).await;
        let budget = RewardConfig::default().periodic_reward_amount;
        let owner_pending = f.service.pending_reward_balance_of(&owner).await;
        let tenant_pending = f.service.pending_reward_balance_of(&tenant).await;
        let total = &owner_pending + &tenant_pending;
        assert!(total <= budget && &budget - &total < BigUint::from(2u32));

        let mover = RecordingMover::default();
        let claimed = f
            .service
            .claim(&owner, &BigUint::zero(), None, &mover)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.amount, owner_pending);
        assert!(f.service.claim(&owner, &BigUint::zero(), None, &mover).await.unwrap().is_none());
        assert_eq!(mover.transfers.lock().unwrap().len(), 1);

        let err = f
            .service
            .claim(&tenant, &(&tenant_pending + 1u32), None, &mover)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_CLAIM_AMOUNT);

        let events = f.events_named(topics::REWARD_CLAIMED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["recipient"], owner.as_str());
    }

    #[tokio::test]
    async fn test_restore_rebuilds_balances() {
        let f = Fixture::new();
        f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();
        f.service.submit_report(signed(&f.hub2, 2), NOW).await.unwrap();
        f.service.compute_rewards(PERIOD_END).await;

        let restored = restore(&f);
        for recipient in [addr(0x01), addr(0x11), addr(0x02), addr(0x12)] {
            assert_eq!(
                restored.pending_reward_balance_of(&recipient).await,
                f.service.pending_reward_balance_of(&recipient).await
            );
        }

        // The next report continues the numbering.
        let next = NOW + WEEK;
        let report = sign_report(&f.hub1, payload(&f.hub1, 1, NOW - 100, next - 100)).unwrap();
        let report = restored.submit_report(report, next).await.unwrap();
        assert_eq!(report.report_id, 3);
        assert!(!report.last_rewarded_amount.is_zero());
    }

    #[tokio::test]
    async fn test_claim_survives_restore() {
        let f = Fixture::new();
        f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();
        f.service.compute_rewards(PERIOD_END).await;
        let owner = addr(0x01);
        let tenant = addr(0x11);
        let tenant_pending = f.service.pending_reward_balance_of(&tenant).await;

        let mover = RecordingMover::default();
        let claimed = f
            .service
            .claim(&owner, &BigUint::zero(), None, &mover)
            .await
            .unwrap()
            .unwrap();
        let receipt = f.store.claim_receipt(&claimed.transaction_hash).unwrap().unwrap();
        assert_eq!(receipt.recipient, owner);
        assert_eq!(receipt.amount, claimed.amount);
        assert_eq!(receipt.block_number, None);

        let restored = restore(&f);
        assert!(restored.pending_reward_balance_of(&owner).await.is_zero());
        assert!(restored.claim(&owner, &BigUint::zero(), None, &mover).await.unwrap().is_none());
        assert_eq!(mover.transfers.lock().unwrap().len(), 1);
        assert_eq!(restored.pending_reward_balance_of(&tenant).await, tenant_pending);
    }

    #[tokio::test]
    async fn test_chain_claim_counted_once() {
        let f = Fixture::new();
        f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();
        f.service.compute_rewards(PERIOD_END).await;
        let owner = addr(0x01);
        let pending = f.service.pending_reward_balance_of(&owner).await;

        let part = &pending / 3u32;
        let receipt = ClaimReceipt {
            transaction_hash: "0xc1a1".into(),
            recipient: owner.clone(),
            receiver: owner.clone(),
            amount: part.clone(),
            block_number: Some(12),
        };
        assert!(f.service.record_chain_claim(&receipt).await.unwrap());
        assert!(!f.service.record_chain_claim(&receipt).await.unwrap());
        assert_eq!(f.service.pending_reward_balance_of(&owner).await, &pending - &part);

        let restored = restore(&f);
        assert_eq!(restored.pending_reward_balance_of(&owner).await, &pending - &part);

        // A claim paid here and later seen mined is not counted again.
        let mover = RecordingMover::default();
        let claimed = restored
            .claim(&owner, &BigUint::zero(), None, &mover)
            .await
            .unwrap()
            .unwrap();
        let mut mined = claimed.receipt();
        mined.block_number = Some(13);
        assert!(!restored.record_chain_claim(&mined).await.unwrap());
        assert!(restored.pending_reward_balance_of(&owner).await.is_zero());
    }

    #[tokio::test]
    async fn test_unstored_claim_receipt_not_double_counted() {
        let f = Fixture::new();
        f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap();
        f.service.compute_rewards(PERIOD_END).await;
        let tenant = addr(0x11);
        let pending = f.service.pending_reward_balance_of(&tenant).await;

        let mover = RecordingMover::default();
        f.store.set_offline(true);
        let err = f
            .service
            .claim(&tenant, &BigUint::zero(), None, &mover)
            .await
            .unwrap_err();
        assert!(err.should_retry());
        f.store.set_offline(false);

        // Tokens moved, so nothing is claimable again.
        let (receiver, amount) = mover.transfers.lock().unwrap()[0].clone();
        assert_eq!((receiver, &amount), (tenant.clone(), &pending));
        assert!(f.service.pending_reward_balance_of(&tenant).await.is_zero());
        assert!(f.service.claim(&tenant, &BigUint::zero(), None, &mover).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_store_is_transient() {
        let f = Fixture::new();
        f.store.set_offline(true);
        let err = f.service.submit_report(signed(&f.hub1, 1), NOW).await.unwrap_err();
        assert!(err.should_retry());
        f.store.set_offline(false);
        assert!(f.service.submit_report(signed(&f.hub1, 1), NOW).await.is_ok());
    }
}

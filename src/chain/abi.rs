//! Contract bindings for the hub, stake manager, and paymaster, generated
//! with `ethers::contract::abigen!`, grounded in the teacher's
//! `contracts/abi.rs` pattern of inlining a minimal human-readable ABI rather
//! than vendoring a full JSON artifact.

#![allow(clippy::extra_unused_lifetimes)]

use ethers::contract::abigen;

// `relayCall` is deliberately left out of this binding: its
// tuple-of-tuples argument makes the struct name abigen assigns to the
// nested `relayRequest` type an implementation detail we can't pin down
// without compiling, so that one call is ABI-encoded by hand in
// `relay_call.rs` instead.
abigen!(
    RelayHub,
    r#"[
        function balanceOf(address target) public view returns (uint256)
        function depositFor(address target) public payable
        function withdraw(uint256 amount, address payable dest) public
        function calculateCharge(uint256 gasUsed, uint256 gasPrice, uint256 baseRelayFee, uint256 pctRelayFee) public view returns (uint256)
        function getHubOverhead() public view returns (uint256)
        event TransactionRejectedByPaymaster(address indexed relayManager, address indexed paymaster, address indexed from, address to, address relayWorker, bytes4 selector, uint256 innerGasUsed, bytes reason)
        event TransactionRelayed(address indexed relayManager, address indexed relayWorker, address indexed from, address to, address paymaster, bytes4 selector, uint8 status, uint256 charge)
    ]"#,
    event_derives(serde::Deserialize, serde::Serialize)
);

abigen!(
    StakeManager,
    r#"[
        function stakeForAddress(address relayManager, uint256 unstakeDelay) public payable
        function authorizeHubByOwner(address relayManager, address relayHub) public
        function unauthorizeHubByOwner(address relayManager, address relayHub) public
        function unlockStake(address relayManager) public
        function withdrawStake(address relayManager) public
        function getStakeInfo(address relayManager) public view returns (uint256 stake, uint256 unstakeDelay, uint256 withdrawBlock, address owner)
        event StakeAdded(address indexed relayManager, address indexed owner, uint256 stake, uint256 unstakeDelay)
        event StakeUnlocked(address indexed relayManager, address indexed owner, uint256 withdrawBlock)
        event StakeWithdrawn(address indexed relayManager, address indexed owner, uint256 amount)
        event HubAuthorized(address indexed relayManager, address indexed relayHub)
        event HubUnauthorized(address indexed relayManager, address indexed relayHub)
        event OwnerSet(address indexed relayManager, address indexed owner)
    ]"#,
    event_derives(serde::Deserialize, serde::Serialize)
);

abigen!(
    RelayHubRegistry,
    r#"[
        function addRelayWorkers(address[] newRelayWorkers) public
        function registerRelayServer(uint256 baseRelayFee, uint256 pctRelayFee, string url) public
        event RelayWorkersAdded(address indexed relayManager, address[] newRelayWorkers, uint256 workersCount)
        event RelayServerRegistered(address indexed relayManager, uint256 baseRelayFee, uint256 pctRelayFee, string url)
    ]"#,
    event_derives(serde::Deserialize, serde::Serialize)
);

abigen!(
    Paymaster,
    r#"[
        function getGasLimits() public view returns (tuple(uint256 acceptanceBudget, uint256 preRelayedCallGasLimit, uint256 postRelayedCallGasLimit, uint256 calldataSizeLimit) limits)
    ]"#
);

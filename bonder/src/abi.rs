// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::contract::abigen;

// L1 and L2 bridge deployments share most of this surface. Calls that exist on
// one side only are rejected by the gateway based on the chain role.
abigen!(
    TokenBridge,
    r#"[
        event TransferSent(bytes32 indexed transferId, uint256 indexed chainId, address indexed recipient, uint256 amount, bytes32 transferNonce, uint256 bonderFee, uint256 index, uint256 amountOutMin, uint256 deadline)
        event TransfersCommitted(uint256 indexed destinationChainId, bytes32 indexed rootHash, uint256 totalAmount, uint256 rootCommittedAt)
        event TransferRootBonded(bytes32 indexed root, uint256 amount)
        event TransferRootConfirmed(uint256 indexed originChainId, uint256 indexed destinationChainId, bytes32 indexed rootHash, uint256 totalAmount)
        event TransferRootSet(bytes32 indexed rootHash, uint256 totalAmount)
        event WithdrawalBonded(bytes32 indexed transferId, uint256 amount)
        event Withdrew(bytes32 indexed transferId, address indexed recipient, uint256 amount, bytes32 transferNonce)
        event MultipleWithdrawalsSettled(address indexed bonder, bytes32 indexed rootHash, uint256 totalBondsSettled)
        event WithdrawalBondSettled(address indexed bonder, bytes32 indexed transferId, bytes32 indexed rootHash)
        event TransferBondChallenged(bytes32 indexed transferRootId, bytes32 indexed rootHash, uint256 originalAmount)
        function commitTransfers(uint256 destinationChainId) external
        function bondWithdrawal(address recipient, uint256 amount, bytes32 transferNonce, uint256 bonderFee) external
        function bondWithdrawalAndDistribute(address recipient, uint256 amount, bytes32 transferNonce, uint256 bonderFee, uint256 amountOutMin, uint256 deadline) external
        function bondTransferRoot(bytes32 rootHash, uint256 destinationChainId, uint256 totalAmount) external
        function settleBondedWithdrawals(address bonder, bytes32[] transferIds, uint256 totalAmount) external
        function challengeTransferBond(bytes32 rootHash, uint256 originalAmount, uint256 destinationChainId) external payable
        function resolveChallenge(bytes32 rootHash, uint256 originalAmount, uint256 destinationChainId) external
        function getCredit(address bonder) external view returns (uint256)
        function getDebitAndAdditionalDebit(address bonder) external view returns (uint256)
        function getBondedWithdrawalAmount(address bonder, bytes32 transferId) external view returns (uint256)
        function isTransferIdSpent(bytes32 transferId) external view returns (bool)
        function getTransferRoot(bytes32 rootHash, uint256 totalAmount) external view returns (uint256, uint256, uint256)
        function pendingAmountForChainId(uint256 chainId) external view returns (uint256)
        function transferRootCommittedAt(bytes32 transferRootId) external view returns (uint256)
        function transferBonds(bytes32 transferRootId) external view returns (address, uint256, uint256, uint256, address, bool)
        function getChallengeAmountForTransferAmount(uint256 amount) external view returns (uint256)
        function challengeResolutionPeriod() external view returns (uint256)
        function getChainId() external view returns (uint256)
    ]"#,
    event_derives(serde::Deserialize, serde::Serialize)
);

//! Modbus TCP integration tests using `MockModbusServer`.
//!
//! These tests run the async client and the register gateway against a
//! real TCP connection with controllable fault injection.


use cell_common::{CellError, MaskedBits, RegisterAddress};
use cell_fieldbus::{ModbusTcpClient, ModbusTcpConfig, RegisterGateway, RegisterTransport};
use mock_modbus_server::{MockBehavior, MockModbusServer};
use std::sync::Arc;
use std::time::Duration;

fn config_for_server(server: &MockModbusServer) -> ModbusTcpConfig {
    ModbusTcpConfig {
        server_addr: server.local_addr().to_string(),
        unit_id: 1,
        connect_timeout: Duration::from_secs(2),
        io_timeout: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(50),
    }
}

fn gateway_for(client: Arc<ModbusTcpClient>) -> RegisterGateway {
    RegisterGateway::new(client, Duration::from_secs(2))
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_connect_is_idempotent() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    let client = ModbusTcpClient::new(config_for_server(&server));

    client.connect().await.unwrap();
    client.connect().await.unwrap();
    assert!(client.is_operational());

    // A round trip guarantees the server has accepted the socket.
    client.read_holding_registers(1400, 1).await.unwrap();
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_read_holding_registers() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    server.set_register(1490, 0b0000_0110);
    server.set_register(1491, 0xBEEF);

    let client = ModbusTcpClient::new(config_for_server(&server));
    client.connect().await.unwrap();

    let regs = client.read_holding_registers(1490, 2).await.unwrap();
    assert_eq!(regs, vec![0b0000_0110, 0xBEEF]);
}

#[tokio::test]
async fn test_write_single_register() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    let client = ModbusTcpClient::new(config_for_server(&server));
    client.connect().await.unwrap();

    client.write_single_register(1417, 0x0001).await.unwrap();
    assert_eq!(server.register(1417), 0x0001);
    assert_eq!(server.register(1418), 0);
}

#[tokio::test]
async fn test_gateway_bit_operations_over_tcp() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    server.set_register(1414, 0xFFFF);
    let client = Arc::new(ModbusTcpClient::new(config_for_server(&server)));
    client.connect().await.unwrap();
    let gateway = gateway_for(client);

    assert!(gateway
        .read_bit(RegisterAddress::new(1414, 3))
        .await
        .unwrap());

    let mask = MaskedBits {
        register: 1414,
        bits: vec![3, 4, 6, 7],
    };
    gateway.reset_masked_bits(&mask).await.unwrap();
    assert_eq!(server.register(1414), 0xFF27);

    gateway
        .write_bit(RegisterAddress::new(1415, 7), true, None)
        .await
        .unwrap();
    assert_eq!(server.register(1415), 0x0080);
}

// ============================================================================
// Fault injection
// ============================================================================

#[tokio::test]
async fn test_exception_response() {
    let server = MockModbusServer::start(MockBehavior::Exception(0x02)).unwrap();
    let client = ModbusTcpClient::new(config_for_server(&server));
    client.connect().await.unwrap();

    let err = client.read_holding_registers(1400, 1).await.unwrap_err();
    assert_eq!(
        err,
        CellError::Transport("Modbus exception: Illegal Data Address".into())
    );
    // Exceptions are protocol-level; the connection stays usable.
    assert!(client.is_operational());
}

#[tokio::test]
async fn test_wrong_transaction_id_is_rejected() {
    let server = MockModbusServer::start(MockBehavior::WrongTransactionId).unwrap();
    let client = ModbusTcpClient::new(config_for_server(&server));
    client.connect().await.unwrap();

    let err = client.read_holding_registers(1400, 1).await.unwrap_err();
    assert!(err.to_string().contains("Transaction ID mismatch"));
}

#[tokio::test]
async fn test_response_timeout_drops_connection() {
    let server = MockModbusServer::start(MockBehavior::DelayMs(1_000)).unwrap();
    let client = ModbusTcpClient::new(config_for_server(&server));
    client.connect().await.unwrap();

    let err = client.read_holding_registers(1400, 1).await.unwrap_err();
    assert!(matches!(err, CellError::Transport(_)));
    assert!(!client.is_operational());
}

#[tokio::test]
async fn test_reconnects_after_dropped_connection() {
    let server = MockModbusServer::start(MockBehavior::DropConnection).unwrap();
    server.set_register(1400, 1);
    let client = ModbusTcpClient::new(config_for_server(&server));
    client.connect().await.unwrap();

    assert!(client.read_holding_registers(1400, 1).await.is_err());
    assert!(!client.is_operational());

    server.set_behavior(MockBehavior::Normal);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let regs = client.read_holding_registers(1400, 1).await.unwrap();
    assert_eq!(regs, vec![1]);
    assert!(client.is_operational());
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn test_connect_refused() {
    let config = ModbusTcpConfig {
        server_addr: "127.0.0.1:1".into(),
        connect_timeout: Duration::from_millis(500),
        ..ModbusTcpConfig::default()
    };
    let client = ModbusTcpClient::new(config);
    assert!(matches!(
        client.connect().await,
        Err(CellError::Transport(_))
    ));
}

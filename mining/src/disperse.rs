//! Calldata for the batched-disperse contract.
//!
//! The function signatures must stay byte-identical to the deployed
//! contract: `disperseToken(address,address[],uint256[])` and
//! `disperseEther(address[],uint256[])`. Amounts cross as 256-bit wire
//! units.

use sha3::{Digest, Keccak256};

use crate::error::{MiningError, MiningResult};
use crate::wad::Wad;

const WORD: usize = 32;

pub fn disperse_token_calldata(
    token: &str,
    recipients: &[String],
    amounts: &[Wad],
) -> MiningResult<Vec<u8>> {
    if recipients.len() != amounts.len() {
        return Err(MiningError::Inconsistency(format!(
            "disperse call with {} recipients but {} amounts",
            recipients.len(),
            amounts.len()
        )));
    }
    let mut data = selector("disperseToken(address,address[],uint256[])").to_vec();
    data.extend_from_slice(&address_word(&parse_address(token)?));
    // Head: token, then the two tail offsets relative to the argument block.
    let recipients_offset = 3 * WORD;
    let amounts_offset = recipients_offset + (1 + recipients.len()) * WORD;
    data.extend_from_slice(&uint_word(recipients_offset as u128));
    data.extend_from_slice(&uint_word(amounts_offset as u128));
    append_address_array(&mut data, recipients)?;
    append_amount_array(&mut data, amounts);
    Ok(data)
}

pub fn disperse_ether_calldata(recipients: &[String], amounts: &[Wad]) -> MiningResult<Vec<u8>> {
    if recipients.len() != amounts.len() {
        return Err(MiningError::Inconsistency(format!(
            "disperse call with {} recipients but {} amounts",
            recipients.len(),
            amounts.len()
        )));
    }
    let mut data = selector("disperseEther(address[],uint256[])").to_vec();
    let recipients_offset = 2 * WORD;
    let amounts_offset = recipients_offset + (1 + recipients.len()) * WORD;
    data.extend_from_slice(&uint_word(recipients_offset as u128));
    data.extend_from_slice(&uint_word(amounts_offset as u128));
    append_address_array(&mut data, recipients)?;
    append_amount_array(&mut data, amounts);
    Ok(data)
}

fn append_address_array(data: &mut Vec<u8>, addresses: &[String]) -> MiningResult<()> {
    data.extend_from_slice(&uint_word(addresses.len() as u128));
    for address in addresses {
        data.extend_from_slice(&address_word(&parse_address(address)?));
    }
    Ok(())
}

fn append_amount_array(data: &mut Vec<u8>, amounts: &[Wad]) {
    data.extend_from_slice(&uint_word(amounts.len() as u128));
    for amount in amounts {
        data.extend_from_slice(&amount.to_abi_word());
    }
}

fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&digest[..4]);
    selector
}

pub fn parse_address(address: &str) -> MiningResult<[u8; 20]> {
    let hexpart = address.strip_prefix("0x").unwrap_or(address);
    let bytes = hex::decode(hexpart)
        .map_err(|err| MiningError::Inconsistency(format!("bad address {address}: {err}")))?;
    let raw: [u8; 20] = bytes.try_into().map_err(|_| {
        MiningError::Inconsistency(format!("address {address} is not 20 bytes"))
    })?;
    Ok(raw)
}

fn address_word(address: &[u8; 20]) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address);
    word
}

fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "0x4e352cf164e64adcbad318c3a1e222e9eba4ce42";

    #[test]
    fn token_calldata_layout() {
        let recipients = vec![
            "0x1000000000000000000000000000000000000001".to_string(),
            "0x1000000000000000000000000000000000000002".to_string(),
        ];
        let amounts = vec![Wad::from_raw(1), Wad::from_raw(2)];
        let data = disperse_token_calldata(TOKEN, &recipients, &amounts).expect("calldata");
        // selector + 3 head words + (1 + 2) recipient words + (1 + 2) amounts.
        assert_eq!(data.len(), 4 + WORD * (3 + 3 + 3));
        // Token address right-aligned in the first argument word.
        assert_eq!(&data[4 + 12..4 + 32], parse_address(TOKEN).unwrap().as_slice());
        // Recipients offset points past the three head words.
        assert_eq!(data[4 + 2 * WORD - 1], 0x60);
        // Amounts offset skips the recipients block.
        assert_eq!(data[4 + 3 * WORD - 1], 0xc0);
        // Array lengths in place.
        assert_eq!(data[4 + 4 * WORD - 1], 2);
        assert_eq!(data[4 + 7 * WORD - 1], 2);
        // Last amount word carries the raw wire value.
        assert_eq!(data[data.len() - 1], 2);
    }

    #[test]
    fn ether_calldata_layout() {
        let recipients = vec!["0x1000000000000000000000000000000000000001".to_string()];
        let amounts = vec![Wad::from_raw(7)];
        let data = disperse_ether_calldata(&recipients, &amounts).expect("calldata");
        assert_eq!(data.len(), 4 + WORD * (2 + 2 + 2));
        assert_eq!(data[4 + WORD - 1], 0x40);
        assert_eq!(data[4 + 2 * WORD - 1], 0x80);
    }

    #[test]
    fn mismatched_arrays_are_refused() {
        let recipients = vec!["0x1000000000000000000000000000000000000001".to_string()];
        assert!(disperse_token_calldata(TOKEN, &recipients, &[]).is_err());
    }

    #[test]
    fn selectors_differ_per_function() {
        assert_ne!(
            selector("disperseToken(address,address[],uint256[])"),
            selector("disperseEther(address[],uint256[])")
        );
    }
}

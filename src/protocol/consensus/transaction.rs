use sha2::Digest;
use sha2::Sha256;

use super::address::Address;
use super::amount::Amount;

/// Script tag for the minimal pay-to-address output encoding.
const TAG_PAY_TO_ADDRESS: u8 = 0x01;

/// An output script.
///
/// Only the pay-to-address form matters to the coinbase rules; anything else
/// is carried opaquely and simply has no destination.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn pay_to_address(address: &Address) -> Self {
        let addr = address.as_str().as_bytes();
        let mut bytes = Vec::with_capacity(2 + addr.len());
        bytes.push(TAG_PAY_TO_ADDRESS);
        bytes.push(addr.len() as u8);
        bytes.extend_from_slice(addr);
        Self(bytes)
    }

    /// The address this script pays to, if it is a standard pay-to-address
    /// script.
    pub fn address(&self) -> Option<Address> {
        let [TAG_PAY_TO_ADDRESS, len, payload @ ..] = self.0.as_slice() else {
            return None;
        };
        if payload.len() != usize::from(*len) {
            return None;
        }
        let s = std::str::from_utf8(payload).ok()?;
        Address::parse(s).ok()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxInput {
    /// Coinbase inputs carry the height/extranonce encoding here.
    pub script_sig: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    pub value: Amount,
    pub script_pubkey: Script,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// A coinbase transaction paying the whole reward to one script.
    pub fn coinbase(script_pubkey: Script, value: Amount) -> Self {
        Self {
            inputs: vec![TxInput::default()],
            outputs: vec![TxOutput {
                value,
                script_pubkey,
            }],
        }
    }

    /// Destinations of this transaction's outputs, in output order.
    /// Outputs without a standard destination are skipped; duplicates are
    /// preserved.
    pub fn destinations(&self) -> Vec<Address> {
        self.outputs
            .iter()
            .filter_map(|out| out.script_pubkey.address())
            .collect()
    }

    /// Transaction id: double SHA-256 over the serialized transaction.
    pub fn txid(&self) -> [u8; 32] {
        let mut bytes = Vec::new();
        self.serialize_into(&mut bytes);
        let first = Sha256::digest(&bytes);
        Sha256::digest(first).into()
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            out.extend_from_slice(&(input.script_sig.len() as u32).to_le_bytes());
            out.extend_from_slice(&input.script_sig);
        }
        out.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            out.extend_from_slice(&output.value.units().to_le_bytes());
            out.extend_from_slice(&(output.script_pubkey.as_bytes().len() as u32).to_le_bytes());
            out.extend_from_slice(output.script_pubkey.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> Address {
        Address::parse("mfWxJ45yp2SFn7UciZyNpvDKrzbhyfKrY8").unwrap()
    }

    #[test]
    fn pay_to_address_round_trips() {
        let script = Script::pay_to_address(&address());
        assert_eq!(Some(address()), script.address());
    }

    #[test]
    fn opaque_scripts_have_no_destination() {
        assert_eq!(None, Script::from_bytes(vec![]).address());
        assert_eq!(None, Script::from_bytes(vec![0x6a, 0x00]).address());
        // Truncated payload.
        assert_eq!(
            None,
            Script::from_bytes(vec![TAG_PAY_TO_ADDRESS, 30, b'x']).address()
        );
    }

    #[test]
    fn coinbase_destinations_in_output_order() {
        let other = Address::parse("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2").unwrap();
        let mut tx = Transaction::coinbase(Script::pay_to_address(&address()), Amount::from_coins(50));
        tx.outputs.push(TxOutput {
            value: Amount::zero(),
            script_pubkey: Script::from_bytes(vec![0x6a]),
        });
        tx.outputs.push(TxOutput {
            value: Amount::zero(),
            script_pubkey: Script::pay_to_address(&other),
        });
        assert_eq!(vec![address(), other], tx.destinations());
    }

    #[test]
    fn txid_changes_with_script_sig() {
        let mut tx = Transaction::coinbase(Script::pay_to_address(&address()), Amount::from_coins(50));
        let before = tx.txid();
        tx.inputs[0].script_sig = vec![1, 2, 3];
        assert_ne!(before, tx.txid());
    }
}
